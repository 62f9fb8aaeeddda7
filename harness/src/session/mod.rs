pub mod machine;
pub mod state;
pub mod tracker;

pub use machine::*;
pub use state::*;
pub use tracker::*;
