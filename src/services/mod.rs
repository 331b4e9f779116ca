pub mod acquisition;
pub mod artifacts;
pub mod queue;
pub mod router;
pub mod scoring;
pub mod stage;
pub mod supervisor;
