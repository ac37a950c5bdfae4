//! Dockerfile parsing and stage planning.

pub mod args;
pub mod expand;
pub mod parser;
pub mod stages;

pub use args::BuildArgs;
pub use parser::{
    AddSpec, ArgDecl, Command, CopySpec, Dockerfile, HealthcheckSpec, Heredoc, Instruction,
    InstructionKind, Mount, RunSpec, Stage,
};
pub use stages::{plan, BaseConfigSource, NoRemoteBase, Plan, ResolvedStage, NO_BASE_IMAGE};
