// Domain layer: entities and the ports the bootstrap sequence talks through.

pub mod model;
pub mod ports;
