//! The application image format.
//!
//! An image starts with a fixed [`ImageHeader`], followed by up to [`MAX_SEGMENTS`]
//! segments, each prefixed by a load address and a length. The first segment begins
//! with the [`AppDescriptor`], so the first [`IMAGE_METADATA_LEN`] bytes of an image
//! are enough to learn its version.
//!
//! After the last segment, the image is padded with zeros so that a one byte checksum
//! lands on the last byte of a 16 byte boundary. The checksum is the XOR of all segment
//! data, seeded with [`CHECKSUM_SEED`]. If the header says so, the SHA-256 digest of
//! everything up to and including the checksum byte follows. Anything after that is
//! ignored.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::version::ImageVersion;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const CHECKSUM_SEED: u8 = 0xEF;

pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const APP_DESC_LEN: usize = 256;
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
/// Number of leading bytes needed to read the version of an image.
pub const IMAGE_METADATA_LEN: usize = APP_DESC_OFFSET + APP_DESC_LEN;

pub const MAX_SEGMENTS: u8 = 16;
pub const HASH_LEN: usize = 32;

const VERSION_LEN: usize = 32;
const PROJECT_NAME_LEN: usize = 32;
const TIME_LEN: usize = 16;
const DATE_LEN: usize = 16;
const IDF_VER_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("image header too short: got {received} bytes, need {needed}")]
    TooShort { received: usize, needed: usize },
    #[error("invalid image magic byte {0:#04x}")]
    ImageMagic(u8),
    #[error("invalid application descriptor magic {0:#010x}")]
    DescriptorMagic(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("invalid image header")]
    Header(#[from] HeaderError),
    #[error("image declares {0} segments, expected 1 to {MAX_SEGMENTS}")]
    SegmentCount(u8),
    #[error("image ends early at offset {offset}")]
    Truncated { offset: u64 },
    #[error("image checksum mismatch: stored {stored:#04x}, computed {computed:#04x}")]
    Checksum { stored: u8, computed: u8 },
    #[error("image digest mismatch: stored {stored}, computed {computed}")]
    Digest { stored: String, computed: String },
    #[error("failed reading image")]
    Io(#[source] io::Error),
}

/// The fixed header at the start of every image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub segment_count: u8,
    pub spi_mode: u8,
    pub spi_speed_size: u8,
    pub entry_addr: u32,
    pub wp_pin: u8,
    pub spi_pin_drv: [u8; 3],
    pub chip_id: u16,
    pub min_chip_rev: u8,
    pub min_chip_rev_full: u16,
    pub max_chip_rev_full: u16,
    pub hash_appended: bool,
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        let bytes = bytes
            .get(..IMAGE_HEADER_LEN)
            .ok_or(HeaderError::TooShort {
                received: bytes.len(),
                needed: IMAGE_HEADER_LEN,
            })?;
        if bytes[0] != IMAGE_MAGIC {
            return Err(HeaderError::ImageMagic(bytes[0]));
        }
        Ok(Self {
            segment_count: bytes[1],
            spi_mode: bytes[2],
            spi_speed_size: bytes[3],
            entry_addr: le_u32(&bytes[4..8]),
            wp_pin: bytes[8],
            spi_pin_drv: [bytes[9], bytes[10], bytes[11]],
            chip_id: le_u16(&bytes[12..14]),
            min_chip_rev: bytes[14],
            min_chip_rev_full: le_u16(&bytes[15..17]),
            max_chip_rev_full: le_u16(&bytes[17..19]),
            // bytes[19..23] are reserved
            hash_appended: bytes[23] == 1,
        })
    }
}

/// Build information embedded at the start of the first segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppDescriptor {
    pub secure_version: u32,
    pub version: String,
    pub project_name: String,
    pub time: String,
    pub date: String,
    pub idf_ver: String,
    pub app_elf_sha256: [u8; HASH_LEN],
}

impl AppDescriptor {
    pub fn parse(bytes: &[u8; APP_DESC_LEN]) -> Result<Self, HeaderError> {
        let magic = le_u32(&bytes[0..4]);
        if magic != APP_DESC_MAGIC {
            return Err(HeaderError::DescriptorMagic(magic));
        }
        let mut fields = FieldReader {
            bytes,
            offset: 16,
        };
        let version = fields.c_str(VERSION_LEN);
        let project_name = fields.c_str(PROJECT_NAME_LEN);
        let time = fields.c_str(TIME_LEN);
        let date = fields.c_str(DATE_LEN);
        let idf_ver = fields.c_str(IDF_VER_LEN);
        let mut app_elf_sha256 = [0; HASH_LEN];
        app_elf_sha256.copy_from_slice(fields.take(HASH_LEN));

        Ok(Self {
            secure_version: le_u32(&bytes[4..8]),
            version,
            project_name,
            time,
            date,
            idf_ver,
            app_elf_sha256,
        })
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl FieldReader<'_> {
    fn take(&mut self, len: usize) -> &[u8] {
        let field = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        field
    }

    /// Reads a fixed size, NUL padded string field.
    fn c_str(&mut self, len: usize) -> String {
        let field = self.take(len);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

/// What can be learned about an image from its first [`IMAGE_METADATA_LEN`] bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMetadata {
    header: ImageHeader,
    descriptor: AppDescriptor,
    version: ImageVersion,
    raw_descriptor: [u8; APP_DESC_LEN],
}

impl ImageMetadata {
    /// Parses the metadata from the leading bytes of an image. Trailing bytes past
    /// [`IMAGE_METADATA_LEN`] are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < IMAGE_METADATA_LEN {
            return Err(HeaderError::TooShort {
                received: bytes.len(),
                needed: IMAGE_METADATA_LEN,
            });
        }
        let header = ImageHeader::parse(bytes)?;
        let mut raw_descriptor = [0; APP_DESC_LEN];
        raw_descriptor.copy_from_slice(&bytes[APP_DESC_OFFSET..IMAGE_METADATA_LEN]);
        let descriptor = AppDescriptor::parse(&raw_descriptor)?;
        let version = ImageVersion::new(descriptor.version.clone());

        Ok(Self {
            header,
            descriptor,
            version,
            raw_descriptor,
        })
    }

    #[must_use]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    #[must_use]
    pub fn descriptor(&self) -> &AppDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn version(&self) -> &ImageVersion {
        &self.version
    }

    #[must_use]
    pub fn raw_descriptor(&self) -> &[u8; APP_DESC_LEN] {
        &self.raw_descriptor
    }
}

/// Summary of an image that passed [`verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedImage {
    pub header: ImageHeader,
    /// Length of the image including padding, checksum and digest.
    pub len: u64,
    pub checksum: u8,
    pub digest: Option<[u8; HASH_LEN]>,
}

/// Walks a complete image, checking its structure, checksum and appended digest.
pub fn verify<R: Read>(reader: R) -> Result<VerifiedImage, IntegrityError> {
    let mut reader = HashingReader {
        inner: reader,
        hasher: Sha256::new(),
        offset: 0,
    };

    let mut header = [0; IMAGE_HEADER_LEN];
    reader.read_hashed(&mut header)?;
    let header = ImageHeader::parse(&header)?;
    if header.segment_count == 0 || header.segment_count > MAX_SEGMENTS {
        return Err(IntegrityError::SegmentCount(header.segment_count));
    }

    let mut checksum = CHECKSUM_SEED;
    let mut buf = vec![0; 4096];
    for _ in 0..header.segment_count {
        let mut segment = [0; SEGMENT_HEADER_LEN];
        reader.read_hashed(&mut segment)?;
        let mut remaining = le_u32(&segment[4..8]) as usize;
        while remaining > 0 {
            let chunk = &mut buf[..remaining.min(4096)];
            reader.read_hashed(chunk)?;
            checksum = chunk.iter().fold(checksum, |acc, b| acc ^ b);
            remaining -= chunk.len();
        }
    }

    // zero padding, then the checksum on the last byte of a 16 byte block
    let unpadded = reader.offset;
    let len = (unpadded + 1 + 15) & !15;
    let tail = &mut buf[..(len - unpadded) as usize];
    reader.read_hashed(tail)?;
    let stored = tail[tail.len() - 1];
    if stored != checksum {
        return Err(IntegrityError::Checksum {
            stored,
            computed: checksum,
        });
    }

    let computed: [u8; HASH_LEN] = reader.hasher.finalize_reset().into();
    let digest = if header.hash_appended {
        let mut stored = [0; HASH_LEN];
        reader.read_hashed(&mut stored)?;
        if stored != computed {
            return Err(IntegrityError::Digest {
                stored: hex::encode(stored),
                computed: hex::encode(computed),
            });
        }
        Some(computed)
    } else {
        None
    };

    Ok(VerifiedImage {
        header,
        len: reader.offset,
        checksum,
        digest,
    })
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    offset: u64,
}

impl<R: Read> HashingReader<R> {
    fn read_hashed(&mut self, buf: &mut [u8]) -> Result<(), IntegrityError> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => IntegrityError::Truncated {
                offset: self.offset,
            },
            _ => IntegrityError::Io(e),
        })?;
        self.hasher.update(&*buf);
        self.offset += buf.len() as u64;
        Ok(())
    }
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_utils::ImageBuilder;

    #[test]
    fn metadata_is_read_from_leading_bytes() {
        let image = ImageBuilder::new("1.4.2")
            .project_name("blink")
            .secure_version(3)
            .build();

        let metadata = ImageMetadata::parse(&image[..IMAGE_METADATA_LEN]).unwrap();
        assert_eq!(metadata.header().segment_count, 1);
        assert!(metadata.header().hash_appended);
        assert_eq!(metadata.descriptor().secure_version, 3);
        assert_eq!(metadata.version().text(), "1.4.2");
        assert_eq!(
            metadata.version().parsed(),
            Some(crate::FirmwareVersion::new(1, 4, 2))
        );
        assert_eq!(metadata.descriptor().project_name, "blink");
        assert_eq!(
            metadata.raw_descriptor()[..],
            image[APP_DESC_OFFSET..IMAGE_METADATA_LEN]
        );
    }

    #[test]
    fn metadata_needs_full_descriptor() {
        let image = ImageBuilder::new("1.4.2").build();

        let err = ImageMetadata::parse(&image[..IMAGE_METADATA_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            HeaderError::TooShort {
                received: IMAGE_METADATA_LEN - 1,
                needed: IMAGE_METADATA_LEN
            }
        );
    }

    #[test]
    fn unparsable_version_is_kept_as_text() {
        let image = ImageBuilder::new("nightly").build();

        let metadata = ImageMetadata::parse(&image).unwrap();
        assert_eq!(metadata.version().text(), "nightly");
        assert_eq!(metadata.version().parsed(), None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = ImageBuilder::new("1.0.0").build();
        image[0] = 0x00;
        assert_eq!(
            ImageMetadata::parse(&image).unwrap_err(),
            HeaderError::ImageMagic(0x00)
        );

        let mut image = ImageBuilder::new("1.0.0").build();
        image[APP_DESC_OFFSET] ^= 0xFF;
        assert!(matches!(
            ImageMetadata::parse(&image),
            Err(HeaderError::DescriptorMagic(_))
        ));
    }

    #[test]
    fn built_images_verify() {
        for hash_appended in [false, true] {
            let image = ImageBuilder::new("2.0.1")
                .payload(vec![0x5A; 3000])
                .extra_segment(vec![1, 2, 3])
                .hash_appended(hash_appended)
                .build();

            let verified = verify(Cursor::new(&image)).unwrap();
            assert_eq!(verified.len, image.len() as u64);
            assert_eq!(verified.len % 16, 0);
            assert_eq!(verified.digest.is_some(), hash_appended);
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut image = ImageBuilder::new("2.0.1").build();
        let len = image.len() as u64;
        image.extend_from_slice(&[0xFF; 100]);

        assert_eq!(verify(Cursor::new(&image)).unwrap().len, len);
    }

    #[test]
    fn flipped_payload_byte_fails_verification() {
        let mut image = ImageBuilder::new("2.0.1")
            .payload(vec![7; 64])
            .hash_appended(false)
            .build();
        image[IMAGE_METADATA_LEN + 10] ^= 0x01;

        assert!(matches!(
            verify(Cursor::new(&image)),
            Err(IntegrityError::Checksum { .. })
        ));
    }

    #[test]
    fn flipped_digest_byte_fails_verification() {
        let mut image = ImageBuilder::new("2.0.1").hash_appended(true).build();
        let last = image.len() - 1;
        image[last] ^= 0x01;

        assert!(matches!(
            verify(Cursor::new(&image)),
            Err(IntegrityError::Digest { .. })
        ));
    }

    #[test]
    fn truncated_image_fails_verification() {
        let image = ImageBuilder::new("2.0.1").payload(vec![9; 512]).build();

        let err = verify(Cursor::new(&image[..image.len() / 2])).unwrap_err();
        assert!(matches!(err, IntegrityError::Truncated { .. }));
    }
}
