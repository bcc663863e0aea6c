pub mod jobs;
pub mod system;
pub mod tasks;
