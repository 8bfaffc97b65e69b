//! Frame preprocessing
//!
//! Deterministic pipeline from an encoded frame payload to the detector
//! input tensor: strip the data-URI prefix, base64-decode, decode the
//! image (JPEG by default, any common encoding accepted), bilinear-resize
//! to the fixed input edge when dimensions differ, and emit a
//! `[1, 3, size, size]` RGB float tensor with values divided by 255.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;

use crate::error::{AppError, Result};

/// Strip a `data:<mime>;base64,` prefix, returning the bare base64 body
pub fn strip_data_uri(payload: &str) -> &str {
    if !payload.starts_with("data:") {
        return payload;
    }
    match payload.find("base64,") {
        Some(idx) => &payload[idx + "base64,".len()..],
        None => payload,
    }
}

/// Decode a (possibly data-URI-prefixed) base64 image payload to RGB pixels
pub fn decode_image(payload: &str) -> Result<RgbImage> {
    let body = strip_data_uri(payload).trim();
    let raw = BASE64
        .decode(body)
        .map_err(|e| AppError::FrameDecode(format!("invalid base64 payload: {}", e)))?;
    decode_image_bytes(&raw)
}

/// Decode raw encoded image bytes to RGB pixels
pub fn decode_image_bytes(raw: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(raw)
        .map_err(|e| AppError::FrameDecode(format!("image decode failed: {}", e)))?;
    Ok(img.to_rgb8())
}

/// Resize to the detector input edge when needed (bilinear resampling)
pub fn resize_to_input(image: &RgbImage, input_size: u32) -> RgbImage {
    if image.dimensions() == (input_size, input_size) {
        return image.clone();
    }
    image::imageops::resize(image, input_size, input_size, FilterType::Triangle)
}

/// Build the `[1, 3, size, size]` normalized RGB tensor for the detector
///
/// Channel order is red-green-blue, values divided by 255. The image must
/// already be at the detector input size.
pub fn to_input_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}

/// Full pipeline: payload string to detector input tensor
pub fn prepare(payload: &str, input_size: u32) -> Result<Array4<f32>> {
    let image = decode_image(payload)?;
    let resized = resize_to_input(&image, input_size);
    Ok(to_input_tensor(&resized))
}

/// Encode RGB pixels as a JPEG of the given quality
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(image)
        .map_err(|e| AppError::FrameDecode(format!("jpeg encode failed: {}", e)))?;
    Ok(buf)
}

/// Wrap encoded image bytes as a data-URI string
pub fn to_data_uri(encoded: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn test_strip_data_uri() {
        assert_eq!(strip_data_uri("data:image/jpeg;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_uri("data:image/png;base64,QQ=="), "QQ==");
        // Bare base64 passes through
        assert_eq!(strip_data_uri("AAAA"), "AAAA");
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let err = decode_image("not-base64!").unwrap_err();
        assert!(matches!(err, AppError::FrameDecode(_)));
    }

    #[test]
    fn test_decode_rejects_non_image_bytes() {
        let payload = BASE64.encode(b"definitely not a jpeg");
        let err = decode_image(&payload).unwrap_err();
        assert!(matches!(err, AppError::FrameDecode(_)));
    }

    #[test]
    fn test_jpeg_round_trip() {
        let image = solid_image(32, 32, [200, 60, 20]);
        let jpeg = encode_jpeg(&image, 90).unwrap();
        let payload = to_data_uri(&jpeg);
        assert!(payload.starts_with("data:image/jpeg;base64,"));

        let decoded = decode_image(&payload).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
        // Lossy codec: just require the dominant channel to survive
        let pixel = decoded.get_pixel(16, 16);
        assert!(pixel[0] > 150);
    }

    #[test]
    fn test_tensor_layout_and_normalization() {
        let image = solid_image(4, 4, [255, 0, 102]);
        let tensor = to_input_tensor(&image);

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!((tensor[[0, 0, 2, 1]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 2, 1]].abs() < 1e-6);
        assert!((tensor[[0, 2, 2, 1]] - 102.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_only_when_needed() {
        let small = solid_image(4, 4, [10, 20, 30]);
        let resized = resize_to_input(&small, 8);
        assert_eq!(resized.dimensions(), (8, 8));
        // Uniform input stays uniform under bilinear resampling
        assert_eq!(*resized.get_pixel(5, 5), Rgb([10, 20, 30]));

        let exact = solid_image(8, 8, [1, 2, 3]);
        assert_eq!(resize_to_input(&exact, 8).dimensions(), (8, 8));
    }

    #[test]
    fn test_prepare_full_pipeline() {
        let image = solid_image(16, 8, [0, 255, 0]);
        let jpeg = encode_jpeg(&image, 95).unwrap();
        let tensor = prepare(&to_data_uri(&jpeg), 8).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        // Green channel dominates after the lossy round trip
        assert!(tensor[[0, 1, 4, 4]] > 0.8);
        assert!(tensor[[0, 0, 4, 4]] < 0.3);
    }
}
