pub mod changelog;
pub mod issue;
pub mod search;

pub use changelog::*;
pub use issue::*;
pub use search::*;
