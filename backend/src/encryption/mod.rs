//! 加密模块

pub mod service;

pub use service::{EncryptionService, PlainSecretCodec, SecretCodec};
