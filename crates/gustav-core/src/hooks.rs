use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GustavError, Result};
use crate::session::Session;

/// Fixed points in the experiment lifecycle where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    PreExp,
    PreBlock,
    PreTrial,
    PresentTrial,
    PromptResponse,
    PostTrial,
    PostBlock,
    PostExp,
}

impl HookPoint {
    pub const ALL: [HookPoint; 8] = [
        HookPoint::PreExp,
        HookPoint::PreBlock,
        HookPoint::PreTrial,
        HookPoint::PresentTrial,
        HookPoint::PromptResponse,
        HookPoint::PostTrial,
        HookPoint::PostBlock,
        HookPoint::PostExp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreExp => "pre_exp",
            HookPoint::PreBlock => "pre_block",
            HookPoint::PreTrial => "pre_trial",
            HookPoint::PresentTrial => "present_trial",
            HookPoint::PromptResponse => "prompt_response",
            HookPoint::PostTrial => "post_trial",
            HookPoint::PostBlock => "post_block",
            HookPoint::PostExp => "post_exp",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type HookFn = Box<dyn FnMut(&mut Session) -> anyhow::Result<()>>;

pub struct Hook {
    pub name: String,
    func: HookFn,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("name", &self.name).finish()
    }
}

/// Ordered callback chains, one per [`HookPoint`].
#[derive(Debug, Default)]
pub struct HookChains {
    chains: BTreeMap<HookPoint, Vec<Hook>>,
}

impl HookChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback; chains run in registration order.
    pub fn register<F>(&mut self, point: HookPoint, name: &str, func: F)
    where
        F: FnMut(&mut Session) -> anyhow::Result<()> + 'static,
    {
        self.chains.entry(point).or_default().push(Hook {
            name: name.to_string(),
            func: Box::new(func),
        });
    }

    pub fn register_boxed(&mut self, point: HookPoint, name: &str, func: HookFn) {
        self.chains.entry(point).or_default().push(Hook {
            name: name.to_string(),
            func,
        });
    }

    /// Inserts a callback ahead of everything registered so far.
    pub fn register_front<F>(&mut self, point: HookPoint, name: &str, func: F)
    where
        F: FnMut(&mut Session) -> anyhow::Result<()> + 'static,
    {
        self.chains.entry(point).or_default().insert(
            0,
            Hook {
                name: name.to_string(),
                func: Box::new(func),
            },
        );
    }

    /// Moves every callback of `other` to the back of the matching chain.
    pub fn append(&mut self, other: HookChains) {
        for (point, chain) in other.chains {
            self.chains.entry(point).or_default().extend(chain);
        }
    }

    pub fn is_empty(&self, point: HookPoint) -> bool {
        self.chains.get(&point).map_or(true, Vec::is_empty)
    }

    pub fn names(&self, point: HookPoint) -> Vec<&str> {
        self.chains
            .get(&point)
            .map(|chain| chain.iter().map(|h| h.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Freezes the final order, dropping callbacks whose name is disabled.
    pub fn resolve(mut self, disabled: &BTreeSet<String>) -> Self {
        for (point, chain) in self.chains.iter_mut() {
            chain.retain(|hook| {
                let keep = !disabled.contains(&hook.name);
                if !keep {
                    debug!(hook = %hook.name, point = %point, "hook disabled");
                }
                keep
            });
        }
        self
    }

    /// Runs one chain against the session. The first failing callback aborts
    /// the chain; core errors raised inside a hook keep their kind.
    pub fn run(&mut self, point: HookPoint, session: &mut Session) -> Result<()> {
        let Some(chain) = self.chains.get_mut(&point) else {
            return Ok(());
        };
        for hook in chain.iter_mut() {
            if let Err(err) = (hook.func)(session) {
                return Err(match err.downcast::<GustavError>() {
                    Ok(core) => core,
                    Err(source) => GustavError::Hook {
                        name: hook.name.clone(),
                        point,
                        source,
                    },
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ScriptedFrontend;
    use crate::session::tests::test_session;
    use serde_json::json;

    fn push(tag: &'static str) -> impl FnMut(&mut Session) -> anyhow::Result<()> {
        move |s: &mut Session| {
            let entry = s.user.entry("order".to_string()).or_insert(json!(""));
            let text = format!("{}{}", entry.as_str().unwrap_or(""), tag);
            *entry = json!(text);
            Ok(())
        }
    }

    #[test]
    fn chains_run_in_registration_order_with_front_insertion() {
        let mut hooks = HookChains::new();
        hooks.register(HookPoint::PostTrial, "b", push("b"));
        hooks.register(HookPoint::PostTrial, "c", push("c"));
        hooks.register_front(HookPoint::PostTrial, "a", push("a"));
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        hooks.run(HookPoint::PostTrial, &mut session).expect("chain");
        assert_eq!(session.user["order"], json!("abc"));
        assert_eq!(hooks.names(HookPoint::PostTrial), vec!["a", "b", "c"]);
    }

    #[test]
    fn disabled_names_are_filtered_once() {
        let mut hooks = HookChains::new();
        hooks.register(HookPoint::PreBlock, "keep", push("k"));
        hooks.register(HookPoint::PreBlock, "drop", push("d"));
        let disabled: BTreeSet<String> = ["drop".to_string()].into_iter().collect();
        let mut hooks = hooks.resolve(&disabled);
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        hooks.run(HookPoint::PreBlock, &mut session).expect("chain");
        assert_eq!(session.user["order"], json!("k"));
    }

    #[test]
    fn failing_hook_aborts_chain_with_its_name() {
        let mut hooks = HookChains::new();
        hooks.register(HookPoint::PreExp, "boom", |_s: &mut Session| {
            Err(anyhow::anyhow!("speaker not connected"))
        });
        hooks.register(HookPoint::PreExp, "after", push("x"));
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        let err = hooks
            .run(HookPoint::PreExp, &mut session)
            .expect_err("hook fails");
        match err {
            GustavError::Hook { name, point, .. } => {
                assert_eq!(name, "boom");
                assert_eq!(point, HookPoint::PreExp);
            }
            other => panic!("expected hook error, got {}", other),
        }
        assert!(!session.user.contains_key("order"));
    }

    #[test]
    fn core_errors_keep_their_kind() {
        let mut hooks = HookChains::new();
        hooks.register(HookPoint::PreTrial, "stim", |_s: &mut Session| {
            Err(GustavError::StimulusExhausted {
                set: "words".to_string(),
                count: 2,
            }
            .into())
        });
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        let err = hooks.run(HookPoint::PreTrial, &mut session).expect_err("fails");
        assert!(matches!(err, GustavError::StimulusExhausted { .. }));
    }

    #[test]
    fn emptiness_and_point_names() {
        let mut hooks = HookChains::new();
        assert!(hooks.is_empty(HookPoint::PromptResponse));
        hooks.register(HookPoint::PromptResponse, "custom", push("c"));
        assert!(!hooks.is_empty(HookPoint::PromptResponse));
        assert_eq!(hooks.names(HookPoint::PromptResponse), vec!["custom"]);
        assert_eq!(HookPoint::PostBlock.to_string(), "post_block");
    }
}
