//! One shared tuning run over every image

use anyhow::Result;
use candle_core::Tensor;

use super::{Coach, ImageReport, LossValues, TrainingReport, TrainingSession};
use crate::models::Generator;
use crate::training::data_loader::ImageDataset;
use crate::training::progress::StepProgress;
use crate::training::CoachKind;

pub struct MultiIdCoach<G: Generator + 'static> {
    coach: Coach<G>,
}

struct Target {
    name: String,
    real: Tensor,
    pivot: Tensor,
    final_loss: Option<LossValues>,
}

impl<G: Generator + 'static> MultiIdCoach<G> {
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
}

impl<G: Generator + 'static> TrainingSession for MultiIdCoach<G> {
    fn run_training_session(&mut self, dataset: &ImageDataset) -> Result<TrainingReport> {
        let coach = &mut self.coach;
        let limit = coach.config.hyperparameters.max_images_to_invert;
        let epochs = coach.config.hyperparameters.max_pti_steps;
        coach.restart_training()?;

        // invert everything up front, then tune on all pivots jointly
        let mut targets = Vec::new();
        let mut pivot_files = Vec::new();
        for item in dataset.iter() {
            if coach.image_counter >= limit {
                break;
            }
            let pivot = coach.get_inversion(&item.name, &item.image)?;
            pivot_files.push(coach.persist_pivot(&item.name, &pivot)?);
            targets.push(Target {
                name: item.name.clone(),
                real: item.image.to_device(coach.device())?,
                pivot,
                final_loss: None,
            });
            coach.image_counter += 1;
        }
        log::info!("Multi-id tuning of {} image(s) for {} epochs", targets.len(), epochs);

        let progress = StepProgress::new(coach.config.run_name.clone(), epochs, coach.config.logging.log_every);
        let mut use_ball_holder = true;
        for epoch in 0..epochs {
            let mut epoch_loss = 0.0;
            for target in targets.iter_mut() {
                let generated = coach.forward(&target.pivot)?;
                let loss = coach.calc_loss(&generated, &target.real, use_ball_holder, &target.pivot)?;
                let values = LossValues::from_breakdown(&loss)?;
                coach.optimizer_step(&loss.total)?;
                use_ball_holder = coach.next_ball_holder();
                epoch_loss += values.total;
                target.final_loss = Some(values);
            }
            progress.step(epoch + 1, epoch_loss / targets.len().max(1) as f32);
        }
        progress.finish(&format!("{} epochs over {} image(s)", epochs, targets.len()));

        let checkpoint = coach.save_generator("multi_id")?;
        let mut images = Vec::with_capacity(targets.len());
        for (target, pivot_file) in targets.into_iter().zip(pivot_files) {
            let reconstruction = coach.save_reconstruction(&target.name, &target.pivot)?;
            images.push(ImageReport {
                image_id: target.name,
                steps: epochs,
                stopped_early: false,
                final_loss: target.final_loss,
                pivot: pivot_file,
                reconstruction,
            });
        }

        let report = TrainingReport {
            run_name: coach.config.run_name.clone(),
            coach: CoachKind::MultiId,
            mode: coach.mode,
            images,
            checkpoints: vec![checkpoint],
        };
        report.save(&coach.report_path())?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::coaches::tests::{snapshot, toy_coach};
    use crate::training::tests::toy_run_config;
    use candle_core::Device;

    #[test]
    fn test_shared_run_over_all_pivots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.hyperparameters.pt_lpips_lambda = 0.0;
        config.hyperparameters.max_pti_steps = 2;
        config.hyperparameters.max_images_to_invert = 2;
        let (coach, calls) = toy_coach(config)?;
        let original = snapshot(&coach.original_generator().parameters())?;

        let device = Device::Cpu;
        let dataset = ImageDataset::from_tensors(
            ["a", "b", "c"]
                .iter()
                .map(|name| Ok((name.to_string(), Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &device)?)))
                .collect::<Result<Vec<_>>>()?,
        )?;
        let mut trainer = MultiIdCoach::new(coach);
        let report = trainer.run_training_session(&dataset)?;

        assert_eq!(calls.get(), 2);
        assert_eq!(report.images.len(), 2);
        assert_eq!(report.checkpoints.len(), 1);
        assert!(report.checkpoints[0].ends_with("model_toy_multi_id.safetensors"));
        assert!(report.images.iter().all(|r| r.steps == 2 && r.final_loss.is_some()));

        // 2 epochs x 2 images, one optimizer for the whole session
        let coach = trainer.into_inner();
        assert_eq!(coach.optimizer().step_count(), 4);
        assert_eq!(coach.training_step(), 4);
        assert_eq!(snapshot(&coach.original_generator().parameters())?, original);
        assert_ne!(snapshot(&coach.generator().parameters())?, original);
        Ok(())
    }
}
