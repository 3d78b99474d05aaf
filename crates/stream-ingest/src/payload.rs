//! Inbound payload shape matching and frame decoding.
//!
//! Producers disagree on how a frame is wrapped, so every payload is run
//! through a fixed, ordered list of matchers and the first hit wins:
//! an object carrying one of [`IMAGE_KEYS`], a bare string, or raw bytes.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::RgbImage;
use serde_json::Value;

use crate::types::{DecodeError, Payload};

/// Object keys that may carry an encoded image, in lookup order.
pub const IMAGE_KEYS: [&str; 7] = ["frame", "image", "data", "img", "jpeg", "jpg", "png"];

const DATA_URI_MARKER: &str = "base64,";

/// Encoded image located inside a payload.
#[derive(Debug, PartialEq, Eq)]
pub enum EncodedImage<'a> {
    Base64(&'a str),
    Bytes(&'a [u8]),
}

type Matcher = for<'a> fn(&'a Payload) -> Option<Option<EncodedImage<'a>>>;

/// Matchers return `Some(..)` when they recognise the payload shape; the inner
/// option is `None` when the shape matched but carried nothing usable.
const MATCHERS: [Matcher; 3] = [match_object, match_string, match_bytes];

fn match_object(payload: &Payload) -> Option<Option<EncodedImage<'_>>> {
    let Payload::Json(Value::Object(map)) = payload else {
        return None;
    };
    let value = IMAGE_KEYS.iter().find_map(|key| map.get(*key));
    Some(value.and_then(Value::as_str).map(EncodedImage::Base64))
}

fn match_string(payload: &Payload) -> Option<Option<EncodedImage<'_>>> {
    match payload {
        Payload::Json(Value::String(text)) => Some(Some(EncodedImage::Base64(text))),
        _ => None,
    }
}

fn match_bytes(payload: &Payload) -> Option<Option<EncodedImage<'_>>> {
    match payload {
        Payload::Binary(bytes) => Some(Some(EncodedImage::Bytes(bytes))),
        _ => None,
    }
}

/// Find the encoded image inside a payload, if its shape is one we understand.
pub fn locate_image(payload: &Payload) -> Option<EncodedImage<'_>> {
    MATCHERS
        .iter()
        .find_map(|matcher| matcher(payload))
        .flatten()
}

/// Strip an optional data-URI prefix and surrounding whitespace.
pub fn strip_data_uri(text: &str) -> &str {
    match text.split_once(DATA_URI_MARKER) {
        Some((_, body)) => body.trim(),
        None => text.trim(),
    }
}

/// Decode a located image into an RGB pixel buffer.
pub fn decode_image(encoded: EncodedImage<'_>) -> Result<RgbImage, DecodeError> {
    let owned;
    let bytes = match encoded {
        EncodedImage::Base64(text) => {
            owned = STANDARD.decode(strip_data_uri(text))?;
            owned.as_slice()
        }
        EncodedImage::Bytes(bytes) => bytes,
    };
    Ok(image::load_from_memory(bytes)?.into_rgb8())
}

/// Run the full matcher + decode path over one payload.
pub fn decode_payload(payload: &Payload) -> Result<RgbImage, DecodeError> {
    let encoded = locate_image(payload).ok_or(DecodeError::NoImage)?;
    decode_image(encoded)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb};
    use serde_json::json;

    use super::*;

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(4, 3, Rgb([10, 200, 30]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn object_keys_are_tried_in_order() {
        let payload = Payload::Json(json!({"img": "second", "frame": "first"}));
        assert_eq!(locate_image(&payload), Some(EncodedImage::Base64("first")));
    }

    #[test]
    fn first_present_key_with_non_string_value_yields_nothing() {
        let payload = Payload::Json(json!({"frame": 12, "image": "ignored"}));
        assert_eq!(locate_image(&payload), None);
    }

    #[test]
    fn other_shapes_are_ignored() {
        assert_eq!(locate_image(&Payload::Json(json!(42))), None);
        assert_eq!(locate_image(&Payload::Json(json!(["frame"]))), None);
        assert_eq!(locate_image(&Payload::Json(json!({"meta": "x"}))), None);
    }

    #[test]
    fn data_uri_prefix_is_stripped() {
        assert_eq!(strip_data_uri("data:image/jpeg;base64,QUJD"), "QUJD");
        assert_eq!(strip_data_uri(" QUJD\n"), "QUJD");
    }

    #[test]
    fn decodes_data_uri_object() {
        let encoded = STANDARD.encode(png_bytes());
        let payload = Payload::Json(json!({"image": format!("data:image/png;base64,{encoded}")}));
        let image = decode_payload(&payload).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(0, 0), &Rgb([10, 200, 30]));
    }

    #[test]
    fn decodes_bare_string_and_raw_bytes() {
        let bytes = png_bytes();
        let text = Payload::Json(json!(STANDARD.encode(&bytes)));
        assert_eq!(decode_payload(&text).unwrap().dimensions(), (4, 3));
        assert_eq!(
            decode_payload(&Payload::Binary(bytes)).unwrap().dimensions(),
            (4, 3)
        );
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        let payload = Payload::Json(json!({"frame": "not base64 at all!"}));
        assert!(matches!(
            decode_payload(&payload),
            Err(DecodeError::Base64(_))
        ));
        let payload = Payload::Json(json!({"frame": STANDARD.encode(b"hello")}));
        assert!(matches!(decode_payload(&payload), Err(DecodeError::Image(_))));
        assert!(matches!(
            decode_payload(&Payload::Json(json!(null))),
            Err(DecodeError::NoImage)
        ));
    }
}
