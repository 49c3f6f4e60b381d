//! Builds well formed images for tests.

use sha2::{Digest, Sha256};

use crate::image::{
    APP_DESC_LEN, APP_DESC_MAGIC, CHECKSUM_SEED, IMAGE_HEADER_LEN, IMAGE_MAGIC,
};

const DROM_LOAD_ADDR: u32 = 0x3F40_0020;
const IRAM_LOAD_ADDR: u32 = 0x4008_0000;

#[derive(Clone, Debug)]
pub struct ImageBuilder {
    version: String,
    project_name: String,
    secure_version: u32,
    payload: Vec<u8>,
    extra_segments: Vec<Vec<u8>>,
    hash_appended: bool,
}

impl ImageBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            project_name: "ota-test".to_string(),
            secure_version: 0,
            payload: vec![0xA5; 1024],
            extra_segments: Vec::new(),
            hash_appended: true,
        }
    }

    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn secure_version(mut self, secure_version: u32) -> Self {
        self.secure_version = secure_version;
        self
    }

    /// Bytes following the application descriptor in the first segment.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn extra_segment(mut self, data: Vec<u8>) -> Self {
        self.extra_segments.push(data);
        self
    }

    pub fn hash_appended(mut self, hash_appended: bool) -> Self {
        self.hash_appended = hash_appended;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut first = self.descriptor().to_vec();
        first.extend_from_slice(&self.payload);
        let segments = std::iter::once((DROM_LOAD_ADDR, first)).chain(
            self.extra_segments
                .iter()
                .map(|data| (IRAM_LOAD_ADDR, data.clone())),
        );

        let mut image = vec![0; IMAGE_HEADER_LEN];
        image[0] = IMAGE_MAGIC;
        image[2] = 0x02;
        image[3] = 0x20;
        image[4..8].copy_from_slice(&IRAM_LOAD_ADDR.to_le_bytes());
        image[8] = 0xEE;
        image[23] = u8::from(self.hash_appended);

        let mut checksum = CHECKSUM_SEED;
        let mut count = 0u8;
        for (addr, mut data) in segments {
            data.resize(data.len().next_multiple_of(4), 0);
            image.extend_from_slice(&addr.to_le_bytes());
            image.extend_from_slice(&(data.len() as u32).to_le_bytes());
            checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
            image.extend_from_slice(&data);
            count += 1;
        }
        image[1] = count;

        image.resize((image.len() + 1).next_multiple_of(16) - 1, 0);
        image.push(checksum);
        if self.hash_appended {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }

    fn descriptor(&self) -> [u8; APP_DESC_LEN] {
        let mut desc = [0; APP_DESC_LEN];
        desc[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        desc[4..8].copy_from_slice(&self.secure_version.to_le_bytes());
        put_str(&mut desc[16..48], &self.version);
        put_str(&mut desc[48..80], &self.project_name);
        put_str(&mut desc[80..96], "12:00:00");
        put_str(&mut desc[96..112], "Jan  1 2024");
        put_str(&mut desc[112..144], "v5.2.1");
        desc[144..176].copy_from_slice(&Sha256::digest(self.version.as_bytes()));
        desc
    }
}

/// Copies `s` into a NUL padded field, always leaving room for a terminator.
fn put_str(field: &mut [u8], s: &str) {
    let len = s.len().min(field.len() - 1);
    field[..len].copy_from_slice(&s.as_bytes()[..len]);
}
