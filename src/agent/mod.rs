//! Agent task execution.
//!
//! - `RoleRegistry`: which task types exist and how they run
//! - `Generator`: the model call boundary
//! - `TaskRunner`: one attempt in, one classified result out

mod generator;
mod roles;
mod runner;

pub use generator::{Generator, Script, ScriptedGenerator};
pub use roles::{RoleConfig, RoleRegistry, RoleTable};
pub use runner::TaskRunner;
