pub mod atlas;
pub mod camera;
pub mod driver;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod system;
pub mod tracking;
pub mod viz;
pub mod vocabulary;
