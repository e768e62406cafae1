#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use bundle_worker_core::contract::{ObjectStore, StoredObject};
use bundle_worker_core::error::ObjectStoreError;
use zip::write::SimpleFileOptions;

pub const PUBLIC_BASE: &str = "https://cdn.test/bundles";

/// Bucket double that keeps objects in memory and records calls.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: Mutex<Vec<String>>,
    patches: Mutex<Vec<(String, String)>>,
}

impl MemoryObjectStore {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn put_order(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn body_text(&self, key: &str) -> String {
        let object = self.object(key).unwrap_or_else(|| panic!("no object {key}"));
        String::from_utf8(object.body).unwrap()
    }

    pub fn patches(&self) -> Vec<(String, String)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.puts.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: Some(content_type.to_string()),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        Ok(self.object(key))
    }

    async fn content_type(&self, key: &str) -> Result<Option<String>, ObjectStoreError> {
        Ok(self.object(key).and_then(|o| o.content_type))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn set_content_type(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.patches
            .lock()
            .unwrap()
            .push((key.to_string(), content_type.to_string()));
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            object.content_type = Some(content_type.to_string());
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{PUBLIC_BASE}/{key}")
    }
}

/// A zip archive shaped like a hosting-provider zipball.
pub fn zipball(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}
