use super::device::Frame;
use super::errors::{CaptureError, CaptureResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::model::ColorFormat;
use common::{FramePayload, JPEG_DATA_URI_PREFIX};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb, RgbImage};

pub const JPEG_QUALITY: u8 = 80;

const TEXT_X: i32 = 10;
const FPS_BASELINE: i32 = 20;
const DPS_BASELINE: i32 = 40;
const GLYPH_HEIGHT: i32 = 7;
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Renders the overlay, encodes the frame and builds the payload sent to the
/// server.
pub fn render_payload(frame: &Frame) -> CaptureResult<FramePayload> {
    let mut image = to_rgb_image(frame)?;
    draw_label(&mut image, TEXT_X, FPS_BASELINE - GLYPH_HEIGHT, &format!("FPS: {:.2}", frame.fps));
    draw_label(&mut image, TEXT_X, DPS_BASELINE - GLYPH_HEIGHT, &format!("DPS: {:.2}", frame.dps));

    let jpeg = encode_jpeg(&image)?;
    Ok(FramePayload {
        image: format!("{}{}", JPEG_DATA_URI_PREFIX, STANDARD.encode(&jpeg)),
        detections: serde_json::to_string(&frame.detections)?,
        width: frame.width,
        height: frame.height,
    })
}

pub fn encode_jpeg(image: &RgbImage) -> CaptureResult<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|err| CaptureError::Encode(err.to_string()))?;
    Ok(buffer)
}

fn to_rgb_image(frame: &Frame) -> CaptureResult<RgbImage> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.image.len() != expected {
        return Err(CaptureError::BufferSize {
            expected,
            actual: frame.image.len(),
        });
    }

    let pixels = match frame.color_format {
        ColorFormat::Rgb => frame.image.clone(),
        ColorFormat::Bgr => bgr_to_rgb(&frame.image),
    };
    ImageBuffer::from_vec(frame.width, frame.height, pixels).ok_or(CaptureError::BufferSize {
        expected,
        actual: frame.image.len(),
    })
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn draw_label(image: &mut RgbImage, mut x: i32, top: i32, text: &str) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = top + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, TEXT_COLOR);
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

// 5x7 点阵字体，仅覆盖叠加文字用到的字符
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'D' => Some([
            0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn white_frame(width: u32, height: u32, color_format: ColorFormat) -> Frame {
        Frame {
            image: vec![255; (width * height * 3) as usize],
            color_format,
            fps: 29.97,
            dps: 14.5,
            detections: json!({"class_ids": [3]}),
            width,
            height,
        }
    }

    #[test]
    fn test_payload_is_jpeg_data_uri() {
        let frame = white_frame(64, 48, ColorFormat::Rgb);
        let payload = render_payload(&frame).unwrap();

        assert!(payload.image.starts_with(JPEG_DATA_URI_PREFIX));
        let jpeg = STANDARD
            .decode(&payload.image[JPEG_DATA_URI_PREFIX.len()..])
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded: serde_json::Value = serde_json::from_str(&payload.detections).unwrap();
        assert_eq!(decoded, json!({"class_ids": [3]}));
        assert_eq!((payload.width, payload.height), (64, 48));
    }

    #[test]
    fn test_overlay_draws_black_text_rows() {
        let frame = white_frame(64, 48, ColorFormat::Rgb);
        let mut image = to_rgb_image(&frame).unwrap();
        draw_label(&mut image, TEXT_X, FPS_BASELINE - GLYPH_HEIGHT, "FPS: 1.00");

        let dark_in_band = (FPS_BASELINE - GLYPH_HEIGHT..FPS_BASELINE)
            .flat_map(|y| (0..64).map(move |x| (x, y)))
            .filter(|&(x, y)| image.get_pixel(x as u32, y as u32) == &TEXT_COLOR)
            .count();
        assert!(dark_in_band > 0);
        // nothing drawn left of the text origin
        assert!((0..TEXT_X as u32).all(|x| image.get_pixel(x, 15) != &TEXT_COLOR));
    }

    #[test]
    fn test_bgr_frames_are_swapped() {
        let mut frame = white_frame(1, 1, ColorFormat::Bgr);
        frame.image = vec![10, 20, 30];
        let image = to_rgb_image(&frame).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([30, 20, 10]));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let mut frame = white_frame(4, 4, ColorFormat::Rgb);
        frame.image.truncate(10);
        assert!(matches!(
            render_payload(&frame),
            Err(CaptureError::BufferSize { expected: 48, actual: 10 })
        ));
    }
}
