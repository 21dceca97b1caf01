//! Networks the tuning core works with
//!
//! `generator` defines the generator contract and the style-based generator
//! shipped with the crate, `encoder` the e4e-style latent encoder used for
//! W+ inversion, and `params` the tagged parameter storage both build on.

pub mod encoder;
pub mod generator;
pub mod params;

pub use encoder::{E4eEncoder, EncodeOptions, EncoderConfig, EncoderOutput, LatentEncoder};
pub use generator::{Generator, GeneratorConfig, NoiseMode, StyleGenerator};
pub use params::{ParameterGroup, ParameterStore, TaggedParameter};
