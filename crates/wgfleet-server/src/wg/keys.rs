//! WireGuard key material.
//!
//! The primary path shells out to `wg genkey` / `wg pubkey` / `wg genpsk`.
//! When the tool is missing or failing we derive a keypair in-process with
//! x25519-dalek instead, which produces a real Curve25519 pair (the public
//! key is the scalar product of the private key, not independent random
//! bytes), so fallback-generated peers still tunnel.

use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{WgError, WgRunner};

#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

/// Key generator with an explicit, process-scoped "warned once" flag.
pub struct KeyGenerator<R> {
    runner: R,
    fallback_warned: AtomicBool,
}

impl<R: WgRunner> KeyGenerator<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Generate a private/public keypair. Infallible: tool failures degrade
    /// to in-process derivation.
    pub async fn generate_keypair(&self) -> Keypair {
        match self.tool_keypair().await {
            Ok(pair) => pair,
            Err(err) => {
                self.note_fallback(&err);
                Self::derived_keypair()
            }
        }
    }

    /// Generate a preshared key (any 32 random bytes are valid).
    pub async fn generate_preshared_key(&self) -> String {
        match self.runner.run("wg", &["genpsk"], None).await {
            Ok(key) if !key.is_empty() => key,
            Ok(_) => {
                self.note_fallback(&WgError::Tool {
                    program: "wg",
                    detail: "genpsk returned an empty key".into(),
                });
                Self::random_key()
            }
            Err(err) => {
                self.note_fallback(&err);
                Self::random_key()
            }
        }
    }

    async fn tool_keypair(&self) -> Result<Keypair, WgError> {
        let private_key = self.runner.run("wg", &["genkey"], None).await?;
        if private_key.is_empty() {
            return Err(WgError::Tool {
                program: "wg",
                detail: "genkey returned an empty key".into(),
            });
        }
        let public_key = self
            .runner
            .run("wg", &["pubkey"], Some(&private_key))
            .await?;
        Ok(Keypair {
            private_key,
            public_key,
        })
    }

    fn derived_keypair() -> Keypair {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&secret);
        Keypair {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    fn random_key() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }

    fn note_fallback(&self, err: &WgError) {
        if !self.fallback_warned.swap(true, Ordering::Relaxed) {
            warn!(error = %err, "wg tool unavailable, generating key material in-process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runner that always fails, forcing the fallback path.
    #[derive(Clone)]
    struct DownRunner;

    impl WgRunner for DownRunner {
        async fn run(
            &self,
            program: &'static str,
            _args: &[&str],
            _stdin: Option<&str>,
        ) -> Result<String, WgError> {
            Err(WgError::Tool {
                program,
                detail: "unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn fallback_keypair_has_wire_format_shape() {
        let generator = KeyGenerator::new(DownRunner);
        let pair = generator.generate_keypair().await;
        assert_eq!(pair.private_key.len(), 44);
        assert_eq!(pair.public_key.len(), 44);
        assert_ne!(pair.private_key, pair.public_key);
    }

    #[tokio::test]
    async fn fallback_public_key_is_derived_from_private() {
        let generator = KeyGenerator::new(DownRunner);
        let pair = generator.generate_keypair().await;

        let private: [u8; 32] = BASE64
            .decode(&pair.private_key)
            .unwrap()
            .try_into()
            .unwrap();
        let derived = PublicKey::from(&StaticSecret::from(private));
        assert_eq!(BASE64.encode(derived.as_bytes()), pair.public_key);
    }

    #[tokio::test]
    async fn fallback_warns_exactly_once() {
        let generator = KeyGenerator::new(DownRunner);
        assert!(!generator.fallback_warned.load(Ordering::Relaxed));
        generator.generate_keypair().await;
        assert!(generator.fallback_warned.load(Ordering::Relaxed));

        // Flag stays set; a second fallback must not reset it.
        generator.generate_preshared_key().await;
        assert!(generator.fallback_warned.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn preshared_key_fallback_is_valid_base64() {
        let generator = KeyGenerator::new(DownRunner);
        let key = generator.generate_preshared_key().await;
        assert_eq!(key.len(), 44);
        assert_eq!(BASE64.decode(&key).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn successful_tool_output_is_used_verbatim() {
        #[derive(Clone)]
        struct ScriptedRunner;

        impl WgRunner for ScriptedRunner {
            async fn run(
                &self,
                _program: &'static str,
                args: &[&str],
                stdin: Option<&str>,
            ) -> Result<String, WgError> {
                match args {
                    ["genkey"] => Ok("PRIVATE".into()),
                    ["pubkey"] => {
                        assert_eq!(stdin, Some("PRIVATE"));
                        Ok("PUBLIC".into())
                    }
                    other => panic!("unexpected args {other:?}"),
                }
            }
        }

        let generator = KeyGenerator::new(ScriptedRunner);
        let pair = generator.generate_keypair().await;
        assert_eq!(pair.private_key, "PRIVATE");
        assert_eq!(pair.public_key, "PUBLIC");
    }
}
