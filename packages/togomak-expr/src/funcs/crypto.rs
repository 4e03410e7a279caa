//! Hashing and cryptographic functions.

use super::{arg_int, arg_string, register, Function};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::collections::HashMap;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "md5", 1, Some(1), |args| {
        Ok(Value::String(hex::encode(Md5::digest(arg_string(args, 0)?))))
    });
    register(table, "sha1", 1, Some(1), |args| {
        Ok(Value::String(hex::encode(Sha1::digest(arg_string(args, 0)?))))
    });
    register(table, "sha256", 1, Some(1), |args| {
        Ok(Value::String(hex::encode(Sha256::digest(arg_string(args, 0)?))))
    });
    register(table, "sha512", 1, Some(1), |args| {
        Ok(Value::String(hex::encode(Sha512::digest(arg_string(args, 0)?))))
    });
    register(table, "base64sha256", 1, Some(1), |args| {
        Ok(Value::String(BASE64.encode(Sha256::digest(arg_string(args, 0)?))))
    });
    register(table, "base64sha512", 1, Some(1), |args| {
        Ok(Value::String(BASE64.encode(Sha512::digest(arg_string(args, 0)?))))
    });
    register(table, "bcrypt", 1, Some(2), |args| {
        let password = arg_string(args, 0)?;
        let cost = if args.len() > 1 {
            arg_int(args, 1)? as u32
        } else {
            bcrypt::DEFAULT_COST
        };
        bcrypt::hash(password, cost)
            .map(Value::String)
            .map_err(|e| format!("bcrypt failed: {}", e))
    });
    register(table, "rsadecrypt", 2, Some(2), |args| {
        let ciphertext = BASE64
            .decode(arg_string(args, 0)?)
            .map_err(|e| format!("ciphertext must be base64: {}", e))?;
        let pem = arg_string(args, 1)?;
        let key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
            .map_err(|e| format!("invalid RSA private key: {}", e))?;
        let plaintext = key
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|e| format!("decryption failed: {}", e))?;
        String::from_utf8(plaintext)
            .map(Value::String)
            .map_err(|_| "the decrypted data is not valid UTF-8".to_string())
    });
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use std::path::PathBuf;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let table = super::super::standard_functions(PathBuf::from("/"));
        table
            .get(name)
            .unwrap()
            .call(name, args)
            .map_err(|d| d.to_string())
    }

    #[test]
    fn test_digests() {
        assert_eq!(
            call("md5", &["hello".into()]).unwrap(),
            Value::from("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(
            call("sha256", &["hello".into()]).unwrap(),
            Value::from("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(
            call("sha1", &["hello".into()]).unwrap(),
            Value::from("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
    }

    #[test]
    fn test_base64sha256_is_digest_not_hex() {
        let b64 = call("base64sha256", &["hello".into()]).unwrap();
        assert_eq!(
            b64,
            Value::from("LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=")
        );
    }

    #[test]
    fn test_bcrypt_produces_verifiable_hash() {
        let hashed = call("bcrypt", &["secret".into(), Value::from(4)]).unwrap();
        assert!(bcrypt::verify("secret", hashed.as_str().unwrap()).unwrap());
    }

    #[test]
    fn test_rsadecrypt_rejects_garbage() {
        assert!(call("rsadecrypt", &["%%%".into(), "not a key".into()]).is_err());
        assert!(call("rsadecrypt", &["aGk=".into(), "not a key".into()]).is_err());
    }
}
