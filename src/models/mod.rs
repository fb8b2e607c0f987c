pub mod doctor_queue;
pub mod enums;
pub mod patient;
pub mod pharmacy;
pub mod refill;
pub mod status;
pub mod treatment;

pub use doctor_queue::*;
pub use enums::*;
pub use patient::*;
pub use pharmacy::*;
pub use refill::*;
pub use status::*;
pub use treatment::*;
