pub mod buffers;
pub mod capture;
pub mod decode;
pub mod device;
pub mod pipeline;
pub mod replay;
pub mod spectrum;
pub mod window;
