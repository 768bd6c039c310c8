//! pairguard-server: wires cameras, detection, zone evaluation and relays into one
//! supervised process.

pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod startup;

pub use error::{ControlError, StartupError};
pub use events::{journal_path, spawn_journal, DiagnosticEvent, JournalRecord};
pub use logging::{init_console_logging, init_logging, LoggingGuard};
pub use orchestrator::{EventStreams, MachineRuntime, MachineStatus, Orchestrator};
pub use startup::{build_bank, load_detector, plan_machines, MachinePlan, OrchestratorBuilder};
