//! One independent tuning run per image

use anyhow::Result;
use std::path::PathBuf;

use super::{Coach, ImageReport, LossValues, TrainingReport, TrainingSession};
use crate::models::Generator;
use crate::training::data_loader::{ImageDataset, ImageItem};
use crate::training::progress::StepProgress;
use crate::training::CoachKind;

pub struct SingleIdCoach<G: Generator + 'static> {
    coach: Coach<G>,
}

impl<G: Generator + 'static> SingleIdCoach<G> {
    pub fn new(coach: Coach<G>) -> Self {
        Self { coach }
    }

    pub fn coach(&self) -> &Coach<G> {
        &self.coach
    }

    pub fn coach_mut(&mut self) -> &mut Coach<G> {
        &mut self.coach
    }

    pub fn into_inner(self) -> Coach<G> {
        self.coach
    }

    /// Invert `item`, then tune the generator around its pivot until the
    /// perceptual loss drops below the threshold or the step budget runs out.
    pub fn train_image(&mut self, item: &ImageItem) -> Result<(ImageReport, PathBuf)> {
        let coach = &mut self.coach;
        coach.restart_training()?;

        let w_pivot = coach.get_inversion(&item.name, &item.image)?;
        let pivot_file = coach.persist_pivot(&item.name, &w_pivot)?;
        let real = item.image.to_device(coach.device())?;

        let max_steps = coach.config.hyperparameters.max_pti_steps;
        let threshold = coach.config.hyperparameters.lpips_value_threshold;
        let progress = StepProgress::new(item.name.clone(), max_steps, coach.config.logging.log_every);

        let mut use_ball_holder = true;
        let mut final_loss = None;
        let mut steps = 0;
        let mut stopped_early = false;
        for _ in 0..max_steps {
            let generated = coach.forward(&w_pivot)?;
            let loss = coach.calc_loss(&generated, &real, use_ball_holder, &w_pivot)?;
            let values = LossValues::from_breakdown(&loss)?;
            final_loss = Some(values);

            if values.lpips.is_some_and(|lpips| lpips as f64 <= threshold) {
                stopped_early = true;
                break;
            }

            coach.optimizer_step(&loss.total)?;
            use_ball_holder = coach.next_ball_holder();
            steps += 1;
            progress.step(steps, values.total);
        }
        progress.finish(&format!(
            "{} steps{}",
            steps,
            if stopped_early { " (perceptual threshold reached)" } else { "" }
        ));
        let (states, bytes) = coach.optimizer.memory_stats();
        log::debug!("Optimizer held moments for {} tensors ({} bytes)", states, bytes);

        coach.image_counter += 1;
        let checkpoint = coach.save_generator(&item.name)?;
        let reconstruction = coach.save_reconstruction(&item.name, &w_pivot)?;

        Ok((
            ImageReport {
                image_id: item.name.clone(),
                steps,
                stopped_early,
                final_loss,
                pivot: pivot_file,
                reconstruction,
            },
            checkpoint,
        ))
    }
}

impl<G: Generator + 'static> TrainingSession for SingleIdCoach<G> {
    fn run_training_session(&mut self, dataset: &ImageDataset) -> Result<TrainingReport> {
        let limit = self.coach.config.hyperparameters.max_images_to_invert;
        log::info!("Single-id tuning of {} image(s)", dataset.len().min(limit));

        let mut images = Vec::new();
        let mut checkpoints = Vec::new();
        for item in dataset.iter() {
            if self.coach.image_counter >= limit {
                break;
            }
            let (report, checkpoint) = self.train_image(item)?;
            images.push(report);
            checkpoints.push(checkpoint);
        }

        let report = TrainingReport {
            run_name: self.coach.config.run_name.clone(),
            coach: CoachKind::SingleId,
            mode: self.coach.mode,
            images,
            checkpoints,
        };
        report.save(&self.coach.report_path())?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParameterGroup, TaggedParameter};
    use crate::training::coaches::tests::{snapshot, toy_coach};
    use crate::training::coaches::TuningMode;
    use crate::training::tests::toy_run_config;
    use candle_core::{Device, Tensor};

    fn group_snapshot(params: Vec<TaggedParameter>, group: ParameterGroup) -> Result<Vec<Vec<f32>>> {
        let selected: Vec<_> = params.into_iter().filter(|p| p.group == group).collect();
        snapshot(&selected)
    }

    #[test]
    fn test_tuning_moves_working_weights_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.hyperparameters.pt_l2_lambda = 1.0;
        config.hyperparameters.pt_lpips_lambda = 0.0;
        config.hyperparameters.use_locality_regularization = false;
        config.hyperparameters.max_pti_steps = 3;
        let (coach, calls) = toy_coach(config)?;
        let original_before = snapshot(&coach.original_generator().parameters())?;

        let target = Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &Device::Cpu)?;
        let dataset = ImageDataset::from_tensors(vec![("face".to_string(), target)])?;
        let mut trainer = SingleIdCoach::new(coach);
        let report = trainer.run_training_session(&dataset)?;

        assert_eq!(calls.get(), 1);
        assert_eq!(report.images.len(), 1);
        assert_eq!(report.images[0].steps, 3);
        assert!(!report.images[0].stopped_early);
        assert!(report.images[0].pivot.exists());
        assert!(report.checkpoints[0].ends_with("model_toy_face.safetensors"));
        assert!(report.checkpoints[0].exists());
        assert!(trainer.coach().report_path().exists());

        let coach = trainer.into_inner();
        let tuned = snapshot(&coach.generator().parameters())?;
        let original_after = snapshot(&coach.original_generator().parameters())?;
        assert_eq!(original_after, original_before);
        assert_ne!(tuned, original_after);
        Ok(())
    }

    #[test]
    fn test_stops_at_perceptual_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.hyperparameters.pt_lpips_lambda = 1.0;
        config.hyperparameters.lpips_value_threshold = f64::INFINITY;
        let (coach, _) = toy_coach(config)?;

        let target = Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &Device::Cpu)?;
        let dataset = ImageDataset::from_tensors(vec![("face".to_string(), target)])?;
        let mut trainer = SingleIdCoach::new(coach);
        let report = trainer.run_training_session(&dataset)?;

        assert!(report.images[0].stopped_early);
        assert_eq!(report.images[0].steps, 0);
        assert_eq!(trainer.coach().optimizer().step_count(), 0);
        Ok(())
    }

    #[test]
    fn test_respects_image_limit_and_restarts_per_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.hyperparameters.pt_lpips_lambda = 0.0;
        config.hyperparameters.max_pti_steps = 2;
        config.hyperparameters.max_images_to_invert = 2;
        config.logging.save_reconstructions = true;
        let (coach, calls) = toy_coach(config)?;

        let device = Device::Cpu;
        let dataset = ImageDataset::from_tensors(
            ["a", "b", "c"]
                .iter()
                .map(|name| Ok((name.to_string(), Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &device)?)))
                .collect::<Result<Vec<_>>>()?,
        )?;
        let mut trainer = SingleIdCoach::new(coach);
        let report = trainer.run_training_session(&dataset)?;

        assert_eq!(calls.get(), 2);
        assert_eq!(report.images.len(), 2);
        assert!(report.images.iter().all(|r| r.reconstruction.as_ref().is_some_and(|p| p.exists())));
        // the optimizer of the last run only saw that run's steps
        assert_eq!(trainer.coach().optimizer().step_count(), 2);
        assert_eq!(trainer.coach().training_step(), 4);
        Ok(())
    }

    #[test]
    fn test_style_mode_leaves_modulation_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.mode = TuningMode::S;
        config.hyperparameters.pt_l2_lambda = 1.0;
        config.hyperparameters.pt_lpips_lambda = 0.0;
        config.hyperparameters.use_locality_regularization = false;
        config.hyperparameters.max_pti_steps = 3;
        let (coach, _) = toy_coach(config)?;
        let styles_before = group_snapshot(coach.generator().parameters(), ParameterGroup::StyleModulation)?;
        let synthesis_before = group_snapshot(coach.generator().parameters(), ParameterGroup::Synthesis)?;

        let target = Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &Device::Cpu)?;
        let dataset = ImageDataset::from_tensors(vec![("face".to_string(), target)])?;
        let mut trainer = SingleIdCoach::new(coach);
        let report = trainer.run_training_session(&dataset)?;
        assert_eq!(report.images[0].steps, 3);

        let g = trainer.coach().generator();
        assert_eq!(group_snapshot(g.parameters(), ParameterGroup::StyleModulation)?, styles_before);
        assert_ne!(group_snapshot(g.parameters(), ParameterGroup::Synthesis)?, synthesis_before);
        Ok(())
    }
}
