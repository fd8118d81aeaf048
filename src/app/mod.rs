// Application services on top of the store: ordering and demand estimates.

pub mod demand;
pub mod ordering;
