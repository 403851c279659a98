//! 凭据加密服务
//!
//! 存储引擎配置中的敏感字段（密码、密钥）以密文保存，
//! 由各存储后端构造时自行解密，引擎核心不接触明文。

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::autobackup::error::{BackupError, Result};

/// Nonce 长度
const NONCE_LEN: usize = 12;

/// 凭据编解码器
pub trait SecretCodec: Send + Sync {
    /// 加密明文，返回可存储的密文字符串
    fn encode(&self, plaintext: &str) -> Result<String>;
    /// 解密密文字符串
    fn decode(&self, ciphertext: &str) -> Result<String>;
}

/// 明文编解码器（未配置密钥时使用）
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSecretCodec;

impl SecretCodec for PlainSecretCodec {
    fn encode(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decode(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// AES-256-GCM 凭据加密服务
///
/// 密文格式：`base64(nonce[12] || ciphertext)`
#[derive(Clone)]
pub struct EncryptionService {
    /// 主密钥（32 字节）
    master_key: [u8; 32],
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

impl EncryptionService {
    /// 创建新的加密服务
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// 从 Base64 密钥创建
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| BackupError::InvalidConfig(format!("密钥不是有效的 Base64: {}", e)))?;
        if key_bytes.len() != 32 {
            return Err(BackupError::InvalidConfig(format!(
                "密钥长度无效: 期望 32 字节，实际 {} 字节",
                key_bytes.len()
            )));
        }

        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&key_bytes);

        Ok(Self::new(master_key))
    }

    /// 生成主密钥并返回 Base64 编码
    pub fn generate_master_key_base64() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.master_key)
            .map_err(|e| BackupError::InvalidConfig(format!("创建加密器失败: {}", e)))
    }
}

impl SecretCodec for EncryptionService {
    fn encode(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| BackupError::InvalidConfig(format!("凭据加密失败: {}", e)))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    fn decode(&self, ciphertext: &str) -> Result<String> {
        let packed = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| BackupError::InvalidConfig(format!("凭据密文不是有效的 Base64: {}", e)))?;
        if packed.len() <= NONCE_LEN {
            return Err(BackupError::InvalidConfig("凭据密文长度不足".to_string()));
        }

        let (nonce, body) = packed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| BackupError::InvalidConfig("凭据解密失败，请确认密钥正确".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| BackupError::InvalidConfig("凭据明文不是有效的 UTF-8".to_string()))
    }
}
