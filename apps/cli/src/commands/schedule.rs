//! Schedule preview command.

use anyhow::bail;
use colored::Colorize;
use comfy_table::{Cell, Color as ComfyColor, Table};
use meridian_training::{CurriculumStage, ScheduleEngine, StepSchedule};
use std::path::Path;

/// Which steps to show.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleWindow {
    pub from: u64,
    pub to: Option<u64>,
    pub every: Option<u64>,
}

impl ScheduleWindow {
    /// Steps in `[from, to]`; without `every`, about twenty rows evenly spaced.
    /// The phase boundaries inside the window are always included.
    fn steps(&self, schedule: &ScheduleEngine) -> anyhow::Result<Vec<u64>> {
        let to = self.to.unwrap_or_else(|| schedule.total_steps());
        if self.from > to {
            bail!("--from {} is past --to {}", self.from, to);
        }
        let every = match self.every {
            Some(0) => bail!("--every must be >= 1"),
            Some(n) => n,
            None => ((to - self.from) / 20).max(1),
        };

        let p = schedule.params();
        let mut steps: Vec<u64> = (self.from..=to).step_by(every as usize).collect();
        steps.extend(
            [p.warmup_steps, p.decay_steps, p.staged_warmup_steps, to]
                .into_iter()
                .filter(|s| (self.from..=to).contains(s)),
        );
        steps.sort_unstable();
        steps.dedup();
        Ok(steps)
    }
}

pub fn execute(path: &Path, window: ScheduleWindow, json: bool) -> anyhow::Result<()> {
    let (config, _) = super::load_manifest(path)?;
    let schedule = ScheduleEngine::from_config(&config)?;
    let rows: Vec<StepSchedule> = window.steps(&schedule)?.into_iter().map(|s| schedule.at(s)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let p = schedule.params();
    println!("{}", "meridian schedule".bold().cyan());
    println!();
    println!(
        "  peak {:e} → end {:e}, warmup {} steps, decay until {}, {} total",
        p.peak_learning_rate, p.end_learning_rate, p.warmup_steps, p.decay_steps, p.total_steps
    );
    println!(
        "  context {} until step {}, then {}",
        p.warmup_train_context, p.staged_warmup_steps, p.max_context
    );
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Step", "Learning rate", "Context", "Stage", "Tokens (B)"]);
    for row in &rows {
        let stage = match row.stage {
            CurriculumStage::Warmup => Cell::new("warmup").fg(ComfyColor::Yellow),
            CurriculumStage::Full => Cell::new("full").fg(ComfyColor::Green),
        };
        table.add_row(vec![
            Cell::new(row.step),
            Cell::new(format!("{:.6e}", row.learning_rate)),
            Cell::new(row.context_length),
            stage,
            Cell::new(format!("{:.4}", schedule.tokens_seen(row.step) as f64 / 1e9)),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_training::ScheduleParams;

    fn engine() -> ScheduleEngine {
        ScheduleEngine::new(ScheduleParams {
            peak_learning_rate: 1e-3,
            end_learning_rate: 1e-4,
            warmup_steps: 10,
            decay_steps: 95,
            total_steps: 100,
            staged_warmup_steps: 33,
            warmup_train_context: 256,
            max_context: 1024,
            batch_size: 8,
            gradient_accumulation_steps: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_default_window_includes_phase_boundaries() {
        let window = ScheduleWindow { from: 0, to: None, every: None };
        let steps = window.steps(&engine()).unwrap();
        assert_eq!(steps.first(), Some(&0));
        assert_eq!(steps.last(), Some(&100));
        for boundary in [10, 33, 95] {
            assert!(steps.contains(&boundary), "missing {boundary}");
        }
    }

    #[test]
    fn test_explicit_stride() {
        let window = ScheduleWindow { from: 40, to: Some(60), every: Some(10) };
        assert_eq!(window.steps(&engine()).unwrap(), [40, 50, 60]);
    }

    #[test]
    fn test_rejects_inverted_window() {
        let window = ScheduleWindow { from: 60, to: Some(40), every: None };
        assert!(window.steps(&engine()).is_err());
        let zero = ScheduleWindow { from: 0, to: Some(40), every: Some(0) };
        assert!(zero.steps(&engine()).is_err());
    }
}
