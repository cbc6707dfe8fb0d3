pub mod payment;
pub mod callback;

pub use payment::*;
pub use callback::*;
