pub mod call;
pub mod convert;
pub mod cookie_service;
pub mod scheduler_service;
pub mod server;

pub use call::{Gate, RpcContext};
pub use cookie_service::CookieService;
pub use scheduler_service::SchedulerService;
pub use server::GrpcServer;
