//! 图像缩放 (fast_image_resize)

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::RgbImage;

/// RGB图像缩放到 `width`×`height` (双线性), 尺寸不变时直接复制
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    let (width, height) = (width.max(1), height.max(1));
    if image.dimensions() == (width, height) {
        return Ok(image.clone());
    }

    let src = fr::images::Image::from_vec_u8(
        image.width(),
        image.height(),
        image.as_raw().clone(),
        fr::PixelType::U8x3,
    )
    .context("源图像缓冲区无效")?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .context("图像缩放失败")?;

    RgbImage::from_raw(width, height, dst.into_vec()).context("缩放结果尺寸不符")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_resize_changes_dimensions() {
        let img = RgbImage::from_pixel(64, 48, Rgb([200, 10, 10]));
        let out = resize_rgb(&img, 32, 24).unwrap();
        assert_eq!(out.dimensions(), (32, 24));
        // 纯色图缩放后仍为同一颜色 (允许定点舍入误差)
        let Rgb([r, g, b]) = *out.get_pixel(10, 10);
        assert!(r.abs_diff(200) <= 1 && g.abs_diff(10) <= 1 && b.abs_diff(10) <= 1);
    }

    #[test]
    fn test_same_size_is_copy() {
        let img = RgbImage::from_fn(5, 4, |x, y| Rgb([x as u8, y as u8, 0]));
        assert_eq!(resize_rgb(&img, 5, 4).unwrap(), img);
    }
}
