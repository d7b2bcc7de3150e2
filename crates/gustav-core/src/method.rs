//! Method hooks: the callbacks that decide when a trial and a block end.
//!
//! They are inserted at the front of their chains, so anything a user
//! registers at the same point sees the state after the method ran.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adaptive::{AdaptiveConfig, AdaptiveTrack};
use crate::error::GustavError;
use crate::hooks::{HookChains, HookPoint};
use crate::session::{ConstantConfig, Method, Session};

pub const CANCELLED_MSG: &str = "cancelled by operator";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    #[default]
    Constant,
    Adaptive,
}

impl MethodKind {
    pub fn build(self, constant: &ConstantConfig, adaptive: &AdaptiveConfig) -> Method {
        match self {
            MethodKind::Constant => Method::Constant(constant.clone()),
            MethodKind::Adaptive => Method::Adaptive(adaptive.clone()),
        }
    }
}

/// Checks a method before any hook runs.
pub fn validate(method: &Method) -> crate::error::Result<()> {
    match method {
        Method::Constant(cfg) if cfg.trials_per_block == 0 => Err(GustavError::config(
            "constant trials_per_block must be at least 1",
        )),
        Method::Constant(_) => Ok(()),
        Method::Adaptive(cfg) => cfg.validate(),
    }
}

/// Registers the method's callbacks at the front of their chains.
pub fn install(method: &Method, hooks: &mut HookChains) {
    match method {
        Method::Constant(_) => {
            hooks.register_front(HookPoint::PostTrial, "constant_post_trial", constant_post_trial);
        }
        Method::Adaptive(_) => {
            hooks.register_front(HookPoint::PreExp, "adaptive_pre_exp", adaptive_pre_exp);
            hooks.register_front(HookPoint::PreBlock, "adaptive_pre_block", adaptive_pre_block);
            hooks.register_front(HookPoint::PostTrial, "adaptive_post_trial", adaptive_post_trial);
            hooks.register_front(HookPoint::PostBlock, "adaptive_post_block", adaptive_post_block);
        }
    }
}

fn constant_post_trial(s: &mut Session) -> anyhow::Result<()> {
    let Method::Constant(cfg) = &s.descriptor.method else {
        return Ok(());
    };
    s.run.trial_on = false;
    if s.run.trials_block + 1 >= cfg.trials_per_block {
        s.run.block_on = false;
    }
    Ok(())
}

fn adaptive_pre_exp(s: &mut Session) -> anyhow::Result<()> {
    if let Method::Adaptive(cfg) = &mut s.descriptor.method {
        cfg.duplicate_first_step();
    }
    Ok(())
}

fn adaptive_pre_block(s: &mut Session) -> anyhow::Result<()> {
    let Some(cfg) = s.descriptor.adaptive() else {
        return Ok(());
    };
    s.dynamic = Some(AdaptiveTrack::new(cfg)?);
    Ok(())
}

fn adaptive_post_trial(s: &mut Session) -> anyhow::Result<()> {
    let completed = s.run.trials_block + 1;
    let response = s.response().to_string();
    let step = s.step_fn.clone();
    let Some(track) = s.dynamic.as_mut() else {
        return Err(GustavError::config("adaptive post_trial ran without a track").into());
    };
    let end = track.update(&response, completed, step.as_ref());
    s.run.trial_on = false;
    if let Some(end) = end {
        info!(
            block = s.run.block + 1,
            good_run = end.good_run,
            msg = %end.msg,
            "adaptive block ended"
        );
        s.run.block_on = false;
    }
    Ok(())
}

fn adaptive_post_block(s: &mut Session) -> anyhow::Result<()> {
    if let Some(track) = s.dynamic.as_mut() {
        if !track.finished {
            track.cancel(CANCELLED_MSG);
        }
        track.finish();
    }
    Ok(())
}
