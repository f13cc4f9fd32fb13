mod backup;
mod forecast;
mod history;
mod layout;
mod mirror;
mod model;
mod scheduler;
mod ser;
mod trainer;
mod utils;
mod weather;
mod writer;

pub use backup::*;
pub use forecast::*;
pub use history::*;
pub use layout::*;
pub use mirror::*;
pub use model::*;
pub use scheduler::*;
pub use ser::*;
pub use trainer::*;
pub use utils::*;
pub use weather::*;
pub use writer::*;
