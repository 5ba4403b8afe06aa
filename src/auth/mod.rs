//! # 认证模块

pub mod token;

pub use token::{TokenAuthenticator, TokenInfo, TokenStatus, parse_allow_ips, parse_authorization};
