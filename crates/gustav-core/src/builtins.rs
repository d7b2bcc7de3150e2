//! Callbacks a settings file can register by name.

use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::warn;

use crate::error::GustavError;
use crate::frontend::{Reply, ResponseRequest};
use crate::hooks::HookFn;
use crate::session::{Response, Session};
use crate::stim::StimKind;

pub const NAMES: &[&str] = &[
    "choose_interval",
    "announce",
    "reset_stimuli",
    "advance_manual",
    "collect_response",
    "noop",
];

pub fn lookup(name: &str) -> Option<HookFn> {
    let func: HookFn = match name {
        "choose_interval" => Box::new(choose_interval),
        "announce" => Box::new(announce),
        "reset_stimuli" => Box::new(reset_stimuli),
        "advance_manual" => Box::new(advance_manual),
        "collect_response" => Box::new(collect_response),
        "noop" => Box::new(|_s: &mut Session| Ok(())),
        _ => return None,
    };
    Some(func)
}

/// The answer the current trial counts as correct, if any.
pub fn expected_answer(s: &Session) -> Option<String> {
    match s.track() {
        Some(track) => Some(track.config.correct.clone()),
        None => s.user.get("correct").map(|v| match v {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }),
    }
}

/// Picks the target interval. Adaptive runs store it in the track; other
/// methods draw one of the valid keys into `user.correct`.
pub fn choose_interval(s: &mut Session) -> anyhow::Result<()> {
    if let Some(track) = s.dynamic.as_mut() {
        track.pick_interval(&mut s.rng);
        return Ok(());
    }
    let key = s
        .descriptor
        .valid_keys
        .choose(&mut s.rng)
        .cloned()
        .ok_or_else(|| GustavError::config("choose_interval needs valid_keys"))?;
    s.user.insert("correct".to_string(), Value::String(key));
    Ok(())
}

pub fn announce(s: &mut Session) -> anyhow::Result<()> {
    let mut message = format!(
        "block {}/{} trial {}",
        s.run.block + 1,
        s.run.nblocks,
        s.run.trials_block + 1
    );
    if let Some(track) = s.track() {
        message.push_str(&format!(
            ": {} = {}{}",
            track.config.name, track.value, track.config.units
        ));
    }
    s.frontend.show(&message)?;
    Ok(())
}

pub fn reset_stimuli(s: &mut Session) -> anyhow::Result<()> {
    for cursor in s.stim.values_mut() {
        cursor.reset();
    }
    Ok(())
}

/// Steps every manual set, which the runner itself never advances.
pub fn advance_manual(s: &mut Session) -> anyhow::Result<()> {
    for cursor in s.stim.values_mut() {
        if cursor.kind == StimKind::Manual {
            cursor.next()?;
        }
    }
    Ok(())
}

/// Default `prompt_response`: asks until the frontend returns a valid or
/// quit key. Quit keys and closed input end the block and the experiment.
pub fn collect_response(s: &mut Session) -> anyhow::Result<()> {
    let expected = expected_answer(s);
    let level = s.track().map(|t| t.value);
    loop {
        let request = ResponseRequest {
            prompt: "response",
            valid_keys: &s.descriptor.valid_keys,
            quit_keys: &s.descriptor.quit_keys,
            expected: expected.as_deref(),
            level,
        };
        let reply = s.frontend.get_response(&request)?;
        let keys = &s.descriptor;
        let response = match reply {
            Reply::Token(token) if keys.quit_keys.contains(&token) => Response::Quit(token),
            Reply::Token(token)
                if keys.valid_keys.is_empty() || keys.valid_keys.contains(&token) =>
            {
                Response::Key(token)
            }
            Reply::Token(token) => {
                let err = GustavError::ResponseInvalid(token);
                warn!(error = %err, "response rejected");
                let hint = format!("{}; valid keys: {}", err, keys.valid_keys.join(", "));
                s.frontend.show(&hint)?;
                continue;
            }
            Reply::NoResponse => Response::NoResponse,
            Reply::Closed => Response::Quit(String::new()),
        };
        if matches!(response, Response::Quit(_)) {
            s.run.block_on = false;
            s.run.exp_is_go = false;
        }
        s.run.response = Some(response);
        return Ok(());
    }
}
