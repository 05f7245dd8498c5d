pub mod audit;
pub mod notification;
pub mod service;
pub mod token;
