//! 哈希工具
//!
//! 为 Pod 模板注解计算稳定的内容哈希，内容变化时触发工作负载滚动更新。

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// 计算字符串的 SHA-256 哈希
pub fn sha256_hash(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let result = hasher.finalize();

    format!("{:x}", result)
}

/// 计算可序列化值的注解哈希
///
/// 调用方应传入有序映射（如 `BTreeMap`），保证同样的内容得到同样的哈希。
pub fn annotation_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_sha256_hash() {
        let hash = sha256_hash(b"hello");
        assert_eq!(hash, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    }

    #[test]
    fn test_annotation_hash_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("tls.crt", "cert");
        a.insert("tls.key", "key");

        let mut b = BTreeMap::new();
        b.insert("tls.key", "key");
        b.insert("tls.crt", "cert");

        assert_eq!(annotation_hash(&a).unwrap(), annotation_hash(&b).unwrap());

        b.insert("tls.key", "other");
        assert_ne!(annotation_hash(&a).unwrap(), annotation_hash(&b).unwrap());
    }
}
