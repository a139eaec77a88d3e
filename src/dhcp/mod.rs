pub mod endpoint;
pub mod hwaddr;
pub mod message_type;
pub mod middleware;
pub mod packet;
pub mod pool;
