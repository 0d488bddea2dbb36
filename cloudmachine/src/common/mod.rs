pub mod errors;

pub use errors::{CloudMachineError, CloudMachineResult};
