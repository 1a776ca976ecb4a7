pub mod background_model;
pub mod event_logger;
pub mod frame;
pub mod mask_refiner;
pub mod motion_region;
pub mod motion_state;
pub mod recording_sink;
pub mod region_extractor;
pub mod render;
pub mod status;
