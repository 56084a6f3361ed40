pub mod rating_change;
pub mod snapshot;
