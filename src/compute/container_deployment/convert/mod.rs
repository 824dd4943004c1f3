//! Pure translation rules between the neutral model and provider-native
//! shapes. Everything here is stateless and unit-tested in place.

pub mod aws_app_runner;
pub mod azure_container_apps;
pub mod ecs;
pub mod google_cloud_run;
