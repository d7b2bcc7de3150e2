//! Experiment runner core: condition planning, stimulus scheduling,
//! adaptive tracking, hook chains and templated output.

pub mod adaptive;
pub mod builtins;
pub mod error;
pub mod frontend;
pub mod hooks;
pub mod method;
pub mod planner;
pub mod range;
pub mod runner;
pub mod save;
pub mod session;
pub mod settings;
pub mod stim;
pub mod template;

pub use adaptive::{AdaptiveConfig, AdaptiveTrack, BlockEnd, StepFn};
pub use error::{GustavError, Result};
pub use frontend::{Frontend, Reply, ResponseRequest, ScriptedFrontend, SimulatedListener, TermFrontend};
pub use hooks::{HookChains, HookPoint};
pub use planner::{plan, Plan, Variable, VariableSpec};
pub use range::{parse_range, unparse_range, OrderPolicy, RangeSpec};
pub use runner::{
    describe, list_conditions, BlockSummary, Experiment, ExperimentBuilder,
    ExperimentDescription, RunSummary,
};
pub use save::{SaveFn, SaveLevel};
pub use session::{Descriptor, Method, Response, RunState, Session};
pub use settings::{resolve_frontend, SettingsFile};
pub use stim::{StimCursor, StimKind, StimSetConfig, Token};
pub use template::{render, TemplateMode, TemplateSource};
