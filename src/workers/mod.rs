// Horadus — Worker Runtime
// Periodic scheduling and task handlers with retry + dead-letter capture.

pub mod scheduler;
pub mod tasks;
