pub mod decision;
pub mod job;
