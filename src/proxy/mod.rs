pub mod pause;
pub mod service;
pub mod target;

pub use pause::{PauseControl, PauseState, WaitAction};
pub use service::{Service, ServiceOptions, TlsConnection};
pub use target::{Target, TargetOptions, TargetState};
