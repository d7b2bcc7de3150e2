//! Transformed up-down adaptive track.
//!
//! An N-down/M-up rule: `downs` consecutive correct responses move the
//! dynamic value down, `ups` consecutive incorrect responses move it up.
//! The step size is taken from `steps`, indexed by the number of reversals
//! so far. A block ends on a floor/ceiling run, a trial count, or once the
//! step schedule is used up; the threshold estimate is the mean of the
//! last `vals_to_avg` reversal values.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GustavError, Result};

/// Custom stepping rule; receives the whole track after the reversal
/// bookkeeping of the current trial. The result is clamped to the floor
/// and ceiling afterwards.
pub type StepFn = Arc<dyn Fn(&mut AdaptiveTrack)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub name: String,
    pub units: String,
    /// Number of presentation intervals per trial.
    pub alternatives: usize,
    /// One step size per reversal.
    pub steps: Vec<f64>,
    pub downs: usize,
    pub ups: usize,
    pub val_start: f64,
    pub val_floor: f64,
    pub val_ceil: f64,
    /// Consecutive floor trials that end a block; 0 disables.
    pub val_floor_n: usize,
    pub val_ceil_n: usize,
    /// Fixed trial count per block; 0 disables.
    pub run_n_trials: usize,
    pub max_trials: usize,
    /// Reversal values averaged for the estimate; 0 averages all.
    pub vals_to_avg: usize,
    /// Response counted as correct, usually set by a `pre_trial` hook.
    pub correct: String,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            name: "value".to_string(),
            units: String::new(),
            alternatives: 3,
            steps: vec![4.0, 2.0],
            downs: 2,
            ups: 1,
            val_start: 0.0,
            val_floor: f64::NEG_INFINITY,
            val_ceil: f64::INFINITY,
            val_floor_n: 3,
            val_ceil_n: 3,
            run_n_trials: 0,
            max_trials: 0,
            vals_to_avg: 0,
            correct: String::new(),
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(GustavError::config("adaptive steps must not be empty"));
        }
        if self.steps.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(GustavError::config(
                "adaptive steps must be finite and non-negative",
            ));
        }
        if self.downs == 0 || self.ups == 0 {
            return Err(GustavError::config("adaptive downs and ups must be at least 1"));
        }
        if self.alternatives == 0 {
            return Err(GustavError::config("adaptive alternatives must be at least 1"));
        }
        if self.val_floor > self.val_ceil {
            return Err(GustavError::config(format!(
                "adaptive floor {} is above ceiling {}",
                self.val_floor, self.val_ceil
            )));
        }
        if !self.val_start.is_finite()
            || self.val_start < self.val_floor
            || self.val_start > self.val_ceil
        {
            return Err(GustavError::config(format!(
                "adaptive start value {} is outside [{}, {}]",
                self.val_start, self.val_floor, self.val_ceil
            )));
        }
        Ok(())
    }

    /// Prepends a copy of the first step so the trials before the first
    /// reversal use the same size as reversal #1.
    pub fn duplicate_first_step(&mut self) {
        if let Some(first) = self.steps.first().copied() {
            self.steps.insert(0, first);
        }
    }
}

/// How an adaptive block ended.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEnd {
    pub good_run: bool,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveTrack {
    pub config: AdaptiveConfig,
    pub value: f64,
    pub values: Vec<f64>,
    pub track: Vec<i8>,
    pub values_at_rev: Vec<f64>,
    pub prev_dir: i8,
    pub init_dir: i8,
    pub cur_ups: usize,
    pub cur_dns: usize,
    pub cur_step: i8,
    pub val_floor_count: usize,
    pub val_ceil_count: usize,
    pub cur_correct: bool,
    pub cur_status: String,
    pub n_reversals: usize,
    pub good_run: bool,
    pub finished: bool,
    pub msg: String,
    pub mean: f64,
    pub sd: f64,
}

impl AdaptiveTrack {
    /// Factory state for a new block.
    pub fn new(config: &AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            value: config.val_start,
            values: Vec::new(),
            track: Vec::new(),
            values_at_rev: Vec::new(),
            prev_dir: 0,
            init_dir: 0,
            cur_ups: 0,
            cur_dns: 0,
            cur_step: 0,
            val_floor_count: 0,
            val_ceil_count: 0,
            cur_correct: false,
            cur_status: " ".to_string(),
            n_reversals: 0,
            good_run: false,
            finished: false,
            msg: String::new(),
            mean: f64::NAN,
            sd: f64::NAN,
        })
    }

    /// Chooses the correct interval uniformly in `1..=alternatives`.
    pub fn pick_interval<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let interval = rng.gen_range(1..=self.config.alternatives);
        self.config.correct = interval.to_string();
        interval
    }

    /// Step size for the current reversal count.
    pub fn step_size(&self) -> f64 {
        let steps = &self.config.steps;
        steps[self.n_reversals.min(steps.len() - 1)]
    }

    /// Reversal count that ends the block.
    pub fn reversals_needed(&self) -> usize {
        self.config.steps.len().saturating_sub(1)
    }

    /// Applies one response. `completed` is the number of trials done in the
    /// block including this one. Returns the terminator when the block ends.
    pub fn update(
        &mut self,
        response: &str,
        completed: usize,
        step: Option<&StepFn>,
    ) -> Option<BlockEnd> {
        self.cur_correct = response == self.config.correct;
        self.values.push(self.value);

        if self.cur_correct {
            self.cur_dns += 1;
            self.cur_ups = 0;
            if self.cur_dns == self.config.downs {
                self.cur_dns = 0;
                self.turn(-1);
            } else {
                self.hold();
            }
        } else {
            self.cur_ups += 1;
            self.cur_dns = 0;
            if self.cur_ups == self.config.ups {
                self.cur_ups = 0;
                self.turn(1);
            } else {
                self.hold();
            }
        }

        let end = self.check_terminators(completed);

        match step {
            Some(custom) => custom.as_ref()(self),
            None => self.value += f64::from(self.cur_step) * self.step_size(),
        }
        self.value = self.value.clamp(self.config.val_floor, self.config.val_ceil);

        debug!(
            value = self.values.last().copied().unwrap_or(self.value),
            next = self.value,
            correct = self.cur_correct,
            status = %self.cur_status,
            reversals = self.n_reversals,
            "adaptive update"
        );

        if let Some(end) = &end {
            self.good_run = end.good_run;
            self.finished = true;
            self.msg = end.msg.clone();
        }
        end
    }

    fn hold(&mut self) {
        self.cur_step = 0;
        self.track.push(0);
        self.cur_status = " ".to_string();
    }

    fn turn(&mut self, dir: i8) {
        self.cur_step = dir;
        if self.prev_dir == dir {
            self.track.push(0);
            self.cur_status = " ".to_string();
        } else if self.prev_dir == 0 {
            self.prev_dir = dir;
            self.init_dir = dir;
            self.track.push(0);
            self.cur_status = if dir < 0 { "v" } else { "^" }.to_string();
        } else {
            self.prev_dir = dir;
            self.track.push(dir);
            self.n_reversals += 1;
            self.values_at_rev.push(self.value);
            let sign = if dir < 0 { '-' } else { '+' };
            self.cur_status = format!("{}{}", sign, self.values_at_rev.len());
        }
    }

    fn check_terminators(&mut self, completed: usize) -> Option<BlockEnd> {
        let cfg = &self.config;
        if self.value == cfg.val_floor {
            if self.cur_step == -1 {
                self.val_floor_count += 1;
                self.cur_status = format!("f{}", self.val_floor_count);
            } else if !self.cur_correct {
                self.val_floor_count = 0;
            }
            if cfg.val_floor_n > 0 && self.val_floor_count == cfg.val_floor_n {
                return Some(BlockEnd {
                    good_run: false,
                    msg: format!("{} consecutive floor trials reached", cfg.val_floor_n),
                });
            }
        } else if self.value == cfg.val_ceil {
            if self.cur_step == 1 {
                self.val_ceil_count += 1;
                self.cur_status = format!("c{}", self.val_ceil_count);
            } else if self.cur_correct {
                self.val_ceil_count = 0;
            }
            if cfg.val_ceil_n > 0 && self.val_ceil_count == cfg.val_ceil_n {
                return Some(BlockEnd {
                    good_run: false,
                    msg: format!("{} consecutive ceiling trials reached", cfg.val_ceil_n),
                });
            }
        }

        if cfg.run_n_trials > 0 && completed >= cfg.run_n_trials {
            Some(BlockEnd {
                good_run: true,
                msg: format!("{} trials reached", cfg.run_n_trials),
            })
        } else if cfg.max_trials > 0 && completed >= cfg.max_trials {
            Some(BlockEnd {
                good_run: true,
                msg: format!("max trials ({}) reached", cfg.max_trials),
            })
        } else if self.n_reversals >= self.reversals_needed() {
            Some(BlockEnd {
                good_run: true,
                msg: format!("{} reversals reached", self.n_reversals),
            })
        } else {
            None
        }
    }

    /// Ends the block without an estimate.
    pub fn cancel(&mut self, msg: &str) {
        self.good_run = false;
        self.finished = true;
        self.msg = msg.to_string();
    }

    /// Computes the threshold estimate over the last `vals_to_avg` reversals.
    pub fn finish(&mut self) {
        if !self.good_run || self.values_at_rev.is_empty() {
            self.mean = f64::NAN;
            self.sd = f64::NAN;
            return;
        }
        let n = self.config.vals_to_avg;
        let vals = if n == 0 || n >= self.values_at_rev.len() {
            &self.values_at_rev[..]
        } else {
            &self.values_at_rev[self.values_at_rev.len() - n..]
        };
        let count = vals.len() as f64;
        let mean = vals.iter().sum::<f64>() / count;
        let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        self.mean = mean;
        self.sd = var.sqrt();
    }

    /// Template lookup for `$dynamic[key]`.
    pub fn field(&self, key: &str) -> Option<String> {
        let join = |vals: &[f64]| {
            vals.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let cfg = &self.config;
        let out = match key {
            "name" => cfg.name.clone(),
            "units" => cfg.units.clone(),
            "alternatives" => cfg.alternatives.to_string(),
            "downs" => cfg.downs.to_string(),
            "ups" => cfg.ups.to_string(),
            "val_start" => cfg.val_start.to_string(),
            "val_floor" => cfg.val_floor.to_string(),
            "val_ceil" => cfg.val_ceil.to_string(),
            "correct" => cfg.correct.clone(),
            "steps" => join(&cfg.steps),
            "val_floor_n" => cfg.val_floor_n.to_string(),
            "val_ceil_n" => cfg.val_ceil_n.to_string(),
            "run_n_trials" => cfg.run_n_trials.to_string(),
            "max_trials" => cfg.max_trials.to_string(),
            "vals_to_avg" => cfg.vals_to_avg.to_string(),
            "value" => self.value.to_string(),
            "last_value" => self
                .values
                .last()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            "values" => join(&self.values),
            "values_at_rev" | "reversals" => join(&self.values_at_rev),
            "track" => self
                .track
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(","),
            "prev_dir" => self.prev_dir.to_string(),
            "init_dir" => self.init_dir.to_string(),
            "cur_ups" => self.cur_ups.to_string(),
            "cur_dns" => self.cur_dns.to_string(),
            "cur_step" => self.cur_step.to_string(),
            "val_floor_count" => self.val_floor_count.to_string(),
            "val_ceil_count" => self.val_ceil_count.to_string(),
            "step_size" => self.step_size().to_string(),
            "cur_status" | "status" => self.cur_status.clone(),
            "cur_correct" => self.cur_correct.to_string(),
            "n_reversals" => self.n_reversals.to_string(),
            "trials" => self.values.len().to_string(),
            "good_run" => self.good_run.to_string(),
            "finished" => self.finished.to_string(),
            "msg" => self.msg.clone(),
            "mean" => self.mean.to_string(),
            "sd" => self.sd.to_string(),
            _ => return None,
        };
        Some(out)
    }
}
