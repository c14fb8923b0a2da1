//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use catalog_extract::core::{ColumnMeta, ResultStream};
use catalog_extract::error::BoxError;
use catalog_extract::{
    Connection, ConnectionSpec, Driver, DriverRegistry, ExtractError, KeyManagementClient,
    KeyReference, Result, ResultRow, Value,
};

pub const FAKE_DRIVER_CLASS: &str = "org.fake.Driver";
pub const FAKE_URL: &str = "fake://source/app";

/// Query results served by [`FakeDriver`], keyed by the exact SQL text.
#[derive(Default)]
pub struct FakeDatabase {
    results: Mutex<HashMap<String, (Vec<String>, Vec<Vec<Value>>)>>,
    stalled: Mutex<HashSet<String>>,
    credentials: Mutex<Option<(String, String)>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Connections dropped, whether closed or abandoned.
    pub drops: AtomicUsize,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `rows` for `sql`.
    pub fn serve(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.results.lock().unwrap().insert(
            sql.to_string(),
            (columns.iter().map(|c| c.to_string()).collect(), rows),
        );
    }

    /// Serve `rows` for `sql`, then never finish the result.
    pub fn serve_then_stall(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.serve(sql, columns, rows);
        self.stalled.lock().unwrap().insert(sql.to_string());
    }

    /// Only accept connections with these credentials.
    pub fn require_credentials(&self, username: &str, password: &str) {
        *self.credentials.lock().unwrap() = Some((username.to_string(), password.to_string()));
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// Wait up to five seconds for `n` connections to be dropped.
    pub async fn wait_for_drops(&self, n: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.drops() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Wait up to five seconds for `n` connections to be opened.
    pub async fn wait_for_connects(&self, n: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connects() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn registry(self: &Arc<Self>) -> Arc<DriverRegistry> {
        let mut registry = DriverRegistry::new();
        registry.register(FAKE_DRIVER_CLASS, Arc::new(FakeDriver { db: self.clone() }));
        Arc::new(registry)
    }
}

pub struct FakeDriver {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("fake://")
    }

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Box<dyn Connection>> {
        self.db.connects.fetch_add(1, Ordering::SeqCst);
        if spec.url != FAKE_URL {
            return Err(ExtractError::connection(
                format!("connecting to {}", spec.url),
                "unknown host",
            ));
        }
        let expected = self.db.credentials.lock().unwrap().clone();
        if let Some((user, password)) = expected {
            let given_user = spec.username.clone().unwrap_or_default();
            let given_password = spec
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            if given_user != user || given_password != password {
                return Err(ExtractError::connection(
                    "connecting to fake source",
                    "password authentication failed",
                ));
            }
        }
        Ok(Box::new(FakeConnection { db: self.db.clone() }))
    }
}

struct FakeConnection {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query<'a>(&'a mut self, sql: &str, _fetch_size: usize) -> Result<ResultStream<'a>> {
        let (columns, rows) = self
            .db
            .results
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| ExtractError::query(sql, "relation does not exist"))?;
        let columns: Arc<[ColumnMeta]> = columns
            .iter()
            .map(|c| ColumnMeta::new(c.as_str(), "text"))
            .collect();
        let rows: Vec<Result<ResultRow>> = rows
            .into_iter()
            .map(|values| Ok(ResultRow::new(columns.clone(), values)))
            .collect();
        if self.db.stalled.lock().unwrap().contains(sql) {
            return Ok(stream::iter(rows).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(rows).boxed())
    }

    async fn close(self: Box<Self>) {
        self.db.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.db.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reverses ciphertext bytes. Counts calls and can fail a chosen call.
#[derive(Debug, Default)]
pub struct CountingKms {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl CountingKms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the `n`th decrypt call (zero-based).
    pub fn failing_on(n: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(n),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyManagementClient for CountingKms {
    async fn decrypt(
        &self,
        _key: &KeyReference,
        ciphertext: &[u8],
    ) -> std::result::Result<SecretString, BoxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if Some(n) == self.fail_on_call {
            return Err("PERMISSION_DENIED: caller lacks cloudkms.cryptoKeyVersions.useToDecrypt".into());
        }
        let mut bytes = ciphertext.to_vec();
        bytes.reverse();
        Ok(SecretString::from(String::from_utf8(bytes)?))
    }
}

/// Ciphertext that [`CountingKms`] decrypts to `plaintext`, base64 encoded.
pub fn encrypt(plaintext: &str) -> String {
    let mut bytes = plaintext.as_bytes().to_vec();
    bytes.reverse();
    BASE64_STANDARD.encode(bytes)
}

pub fn row(values: &[(i64, &str)]) -> Vec<Vec<Value>> {
    values
        .iter()
        .map(|(id, name)| vec![Value::Int(*id), Value::from(*name)])
        .collect()
}
