//! The state handed to every hook.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Local;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adaptive::{AdaptiveConfig, AdaptiveTrack, StepFn};
use crate::error::Result;
use crate::frontend::Frontend;
use crate::hooks::HookPoint;
use crate::planner::Plan;
use crate::stim::{StimCursor, StimKind, Token};
use crate::template::{render, TemplateMode, TemplateSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantConfig {
    pub trials_per_block: usize,
}

impl Default for ConstantConfig {
    fn default() -> Self {
        Self {
            trials_per_block: 1,
        }
    }
}

/// Which procedure drives the trials of a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Constant(ConstantConfig),
    Adaptive(AdaptiveConfig),
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Constant(_) => "constant",
            Method::Adaptive(_) => "adaptive",
        }
    }
}

/// Log and data templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strings {
    pub log_pre_exp: String,
    pub log_pre_block: String,
    pub log_pre_trial: String,
    pub log_post_trial: String,
    pub log_post_block: String,
    pub log_post_exp: String,
    pub data_header: String,
    pub data_trial: String,
    pub data_block: String,
    pub data_exp: String,
}

impl Strings {
    /// Log template emitted after the chain at `point`, if there is one.
    pub fn log_for(&self, point: HookPoint) -> Option<&str> {
        let s = match point {
            HookPoint::PreExp => &self.log_pre_exp,
            HookPoint::PreBlock => &self.log_pre_block,
            HookPoint::PreTrial => &self.log_pre_trial,
            HookPoint::PostTrial => &self.log_post_trial,
            HookPoint::PostBlock => &self.log_post_block,
            HookPoint::PostExp => &self.log_post_exp,
            HookPoint::PresentTrial | HookPoint::PromptResponse => return None,
        };
        Some(s.as_str())
    }

    pub fn has_data(&self) -> bool {
        !(self.data_trial.is_empty() && self.data_block.is_empty() && self.data_exp.is_empty())
    }
}

/// Read-only experiment description, built once at configure time.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: String,
    pub note: String,
    pub comment: String,
    pub subject: String,
    pub host: String,
    /// Data-file path template.
    pub data_file: String,
    /// Log-file path template.
    pub log_file: String,
    pub valid_keys: Vec<String>,
    pub quit_keys: Vec<String>,
    pub method: Method,
    pub frontend: String,
    pub record: bool,
    pub start_block: usize,
    pub start_trial: usize,
    pub disabled: BTreeSet<String>,
    pub seed: Option<u64>,
    pub template_mode: TemplateMode,
    pub strings: Strings,
}

impl Descriptor {
    pub fn adaptive(&self) -> Option<&AdaptiveConfig> {
        match &self.method {
            Method::Adaptive(cfg) => Some(cfg),
            Method::Constant(_) => None,
        }
    }
}

/// One classified response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Response {
    Key(String),
    Quit(String),
    NoResponse,
}

impl Response {
    pub fn as_str(&self) -> &str {
        match self {
            Response::Key(k) | Response::Quit(k) => k,
            Response::NoResponse => "",
        }
    }
}

/// Mutable run counters and flags. Counters are 0-based.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub block: usize,
    pub nblocks: usize,
    pub condition: usize,
    pub trials_block: usize,
    pub trials_exp: usize,
    pub date: String,
    pub time: String,
    pub response: Option<Response>,
    pub block_on: bool,
    pub trial_on: bool,
    pub exp_is_go: bool,
}

impl RunState {
    pub fn stamp(&mut self) {
        let now = Local::now();
        self.date = now.format("%Y-%m-%d").to_string();
        self.time = now.format("%H:%M:%S").to_string();
    }
}

#[derive(Debug, Clone)]
pub struct Variables {
    pub plan: Plan,
    /// Level of every variable in the current condition.
    pub current: BTreeMap<String, String>,
}

pub struct Session {
    pub descriptor: Descriptor,
    pub run: RunState,
    pub var: Variables,
    pub stim: BTreeMap<String, StimCursor>,
    /// Adaptive state of the current block.
    pub dynamic: Option<AdaptiveTrack>,
    pub step_fn: Option<StepFn>,
    /// Free-form values for user hooks and `$user[key]`.
    pub user: BTreeMap<String, Value>,
    pub rng: StdRng,
    pub frontend: Box<dyn Frontend>,
}

impl Session {
    pub fn render(&self, template: &str) -> Result<String> {
        render(template, self, self.descriptor.template_mode)
    }

    /// Advances every non-manual stimulus set.
    pub fn advance_stimuli(&mut self) -> Result<()> {
        for cursor in self.stim.values_mut() {
            if cursor.kind != StimKind::Manual {
                cursor.next()?;
            }
        }
        Ok(())
    }

    pub fn current_token(&self, set: &str) -> Option<&Token> {
        self.stim.get(set).and_then(StimCursor::current)
    }

    pub fn track(&self) -> Option<&AdaptiveTrack> {
        self.dynamic.as_ref()
    }

    pub fn response(&self) -> &str {
        self.run.response.as_ref().map_or("", Response::as_str)
    }
}

impl TemplateSource for Session {
    fn scalar(&self, name: &str) -> Option<String> {
        let d = &self.descriptor;
        let r = &self.run;
        let out = match name {
            "name" => d.name.clone(),
            "note" => d.note.clone(),
            "comment" => d.comment.clone(),
            "host" => d.host.clone(),
            "subj" => d.subject.clone(),
            "date" => r.date.clone(),
            "time" => r.time.clone(),
            "block" => (r.block + 1).to_string(),
            "blocks" => r.nblocks.to_string(),
            "trial" => (r.trials_exp + 1).to_string(),
            "trial_block" => (r.trials_block + 1).to_string(),
            "condition" => (r.condition + 1).to_string(),
            "conditions" => self.var.plan.conditions().to_string(),
            "response" => self.response().to_string(),
            _ => return None,
        };
        Some(out)
    }

    fn var(&self, name: &str) -> Option<String> {
        self.var.current.get(name).cloned()
    }

    fn current_vars(&self) -> Vec<(String, String)> {
        self.var
            .plan
            .names
            .iter()
            .map(|name| {
                let level = self.var.current.get(name).cloned().unwrap_or_default();
                (name.clone(), level)
            })
            .collect()
    }

    fn stim(&self, set: &str, field: &str) -> Option<String> {
        let token = self.current_token(set)?;
        Some(match field {
            "file" => token.basename.clone(),
            "text" => token.text.clone(),
            "kw" => token.keywords.to_string(),
            "ind" => token.index.to_string(),
            _ => return None,
        })
    }

    fn user(&self, key: &str) -> Option<String> {
        self.user.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn dynamic(&self, key: &str) -> Option<String> {
        match &self.dynamic {
            Some(track) => track.field(key),
            None => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frontend::ScriptedFrontend;
    use crate::planner::{plan, Variable, VariableSpec};
    use rand::SeedableRng;
    use serde_json::json;

    pub(crate) fn test_descriptor() -> Descriptor {
        Descriptor {
            name: "tone".to_string(),
            note: String::new(),
            comment: String::new(),
            subject: "s01".to_string(),
            host: "booth".to_string(),
            data_file: String::new(),
            log_file: String::new(),
            valid_keys: vec!["1".to_string(), "2".to_string()],
            quit_keys: vec!["q".to_string()],
            method: Method::Constant(ConstantConfig::default()),
            frontend: "scripted".to_string(),
            record: false,
            start_block: 1,
            start_trial: 1,
            disabled: BTreeSet::new(),
            seed: Some(1),
            template_mode: TemplateMode::Strict,
            strings: Strings::default(),
        }
    }

    pub(crate) fn test_session(frontend: Box<dyn Frontend>) -> Session {
        let mut rng = StdRng::seed_from_u64(1);
        let spec = VariableSpec {
            factorial: vec![
                Variable::new("A", &["A1", "A2"]),
                Variable::new("B", &["B1", "B2", "B3"]),
            ],
            ..VariableSpec::default()
        };
        let plan = plan(&spec, &mut rng).expect("plan");
        Session {
            descriptor: test_descriptor(),
            run: RunState::default(),
            var: Variables {
                plan,
                current: BTreeMap::new(),
            },
            stim: BTreeMap::new(),
            dynamic: None,
            step_fn: None,
            user: BTreeMap::new(),
            rng,
            frontend,
        }
    }

    #[test]
    fn renders_condition_example_against_session() {
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        session.run.condition = 2;
        session.var.current = session.var.plan.condition_levels(1);
        assert_eq!(session.var.current["B"], "B2");
        let out = session
            .render("cond=$condition vars=$currentvarsvals[' ; ']")
            .expect("render");
        assert_eq!(out, "cond=3 vars=A = A1 ; B = B2");
    }

    #[test]
    fn user_values_render_without_json_quotes() {
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        session.user.insert("ear".to_string(), json!("left"));
        session.user.insert("gain".to_string(), json!(2.5));
        let out = session.render("$user[ear] $user[gain] $subj@$host").expect("render");
        assert_eq!(out, "left 2.5 s01@booth");
    }

    #[test]
    fn counters_render_one_based() {
        let mut session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        session.run.block = 0;
        session.run.nblocks = 6;
        session.run.trials_exp = 9;
        session.run.trials_block = 3;
        session.run.response = Some(Response::Key("2".to_string()));
        let out = session
            .render("$block/$blocks $trial $trial_block $response $conditions")
            .expect("render");
        assert_eq!(out, "1/6 10 4 2 6");
    }

    #[test]
    fn dynamic_tokens_require_an_adaptive_track() {
        let session = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        assert!(session.render("$dynamic[value]").is_err());
    }
}
