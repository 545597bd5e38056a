//! Upgrade image format helpers.
//!
//! An image file carries a self-describing trailer so any holder can verify
//! it offline: `payload || "TGIMAGE:" || meta-json || trailer-len (8 bytes,
//! big-endian)`, where `trailer-len` covers the magic plus the JSON. The
//! meta block embeds the MD5 of the payload.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;

use crate::messages::ImageMeta;

/// Magic prefix of the meta trailer.
pub const IMAGE_META_MAGIC: &[u8] = b"TGIMAGE:";

/// Append a meta trailer to an image payload.
pub fn append_image_meta(payload: &[u8], meta: &ImageMeta) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(meta).context("serializing image meta")?;
    let mut out = Vec::with_capacity(payload.len() + IMAGE_META_MAGIC.len() + json.len() + 8);
    out.extend_from_slice(payload);
    out.extend_from_slice(IMAGE_META_MAGIC);
    out.extend_from_slice(&json);
    let trailer_len = (IMAGE_META_MAGIC.len() + json.len()) as u64;
    out.extend_from_slice(&trailer_len.to_be_bytes());
    Ok(out)
}

/// Build a complete image in one step (payload hashing included).
pub fn build_image(payload: &[u8], version: &str, model: &str, board_ids: &[String]) -> Vec<u8> {
    let meta = ImageMeta {
        md5: hex::encode(md5::compute(payload).0),
        version: version.to_string(),
        model: model.to_string(),
        hardware_board_ids: board_ids.to_vec(),
    };
    // Serialization of a plain struct cannot fail.
    append_image_meta(payload, &meta).unwrap_or_default()
}

/// Parse the trailer of an image buffer, returning the payload length and
/// the embedded meta.
pub fn parse_image_meta(image: &[u8]) -> Result<(usize, ImageMeta)> {
    if image.len() < 8 + IMAGE_META_MAGIC.len() {
        bail!("image too short to carry a meta trailer");
    }
    let len_bytes: [u8; 8] = image[image.len() - 8..]
        .try_into()
        .map_err(|_| anyhow!("bad trailer length field"))?;
    let trailer_len = u64::from_be_bytes(len_bytes) as usize;
    if trailer_len < IMAGE_META_MAGIC.len() || trailer_len + 8 > image.len() {
        bail!("image meta trailer length out of range");
    }
    let trailer_start = image.len() - 8 - trailer_len;
    let trailer = &image[trailer_start..image.len() - 8];
    if !trailer.starts_with(IMAGE_META_MAGIC) {
        bail!("image meta magic not found");
    }
    let meta: ImageMeta = serde_json::from_slice(&trailer[IMAGE_META_MAGIC.len()..])
        .context("parsing image meta JSON")?;
    Ok((trailer_start, meta))
}

/// Verify an image buffer against its embedded MD5. Returns the meta on
/// success.
pub fn verify_image(image: &[u8]) -> Result<ImageMeta> {
    let (payload_len, meta) = parse_image_meta(image)?;
    let computed = hex::encode(md5::compute(&image[..payload_len]).0);
    if computed != meta.md5 {
        bail!(
            "image MD5 mismatch: computed {} but meta claims {}",
            computed,
            meta.md5
        );
    }
    Ok(meta)
}

/// Verify an image file on disk.
pub fn verify_image_file(path: &Path) -> Result<ImageMeta> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    verify_image(&bytes)
}
