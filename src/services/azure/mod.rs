pub mod arm_client;
