pub mod container_deployment;
pub mod container_registry;
pub mod containerizer;
pub mod image_pipeline;
pub mod kubernetes;
