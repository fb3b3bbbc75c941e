//! CLI command implementations.
//!
//! | Module  | Commands handled              |
//! |---------|-------------------------------|
//! | `run`   | `Run`, `Worker`               |
//! | `state` | `Status`, `Recover`, `Reset`  |

pub mod run;
pub mod state;

pub use run::{RunArgs, WorkerArgs, cmd_run, cmd_worker};
pub use state::{cmd_recover, cmd_reset, cmd_status};
