//! Terminal QR rendering for tokens and session keys.

use anyhow::Context;
use qrcode::render::unicode;
use qrcode::QrCode;

/// Render `data` as unicode half blocks, light-on-dark so it scans from a dark terminal.
pub fn render(data: &str) -> anyhow::Result<String> {
    let code = QrCode::new(data.as_bytes()).context("Failed to generate QR code")?;
    let image = code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_token_sized_payload() {
        let token = "eyJ0eXBlIjoib2ZmZXIiLCJzZHAiOiJ2PTAifQ".repeat(8);
        let image = render(&token).unwrap();
        assert!(image.lines().count() > 10);
    }

    #[test]
    fn oversized_payload_is_error() {
        assert!(render(&"x".repeat(8000)).is_err());
    }
}
