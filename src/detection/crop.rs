//! 缩放 / 裁剪 / 标注

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use super::BBox;
use crate::imaging::resize_rgb;

/// 标注颜色, 按类别循环使用
const BRIGHT_COLORS: [(u8, u8, u8); 12] = [
    (255, 0, 0),     // 红色
    (0, 255, 0),     // 绿色
    (0, 0, 255),     // 蓝色
    (255, 255, 0),   // 黄色
    (255, 0, 255),   // 品红
    (0, 255, 255),   // 青色
    (255, 128, 0),   // 橙色
    (255, 0, 128),   // 粉红
    (128, 255, 0),   // 黄绿
    (0, 128, 255),   // 天蓝
    (255, 255, 255), // 白色
    (128, 0, 255),   // 紫色
];

/// 推理分辨率 = 原始分辨率 / scale_factor (至少1像素)
pub fn scaled_size(width: u32, height: u32, scale_factor: f32) -> (u32, u32) {
    let w = (width as f32 / scale_factor).round().max(1.0) as u32;
    let h = (height as f32 / scale_factor).round().max(1.0) as u32;
    (w, h)
}

/// 按 scale_factor 缩小原图用于推理
pub fn downscale(image: &RgbImage, scale_factor: f32) -> Result<RgbImage> {
    let (w, h) = scaled_size(image.width(), image.height(), scale_factor);
    resize_rgb(image, w, h)
}

/// 把推理分辨率下的检测框映射回原图坐标
pub fn rescale(boxes: &mut [BBox], sx: f32, sy: f32) {
    for b in boxes.iter_mut() {
        b.x1 *= sx;
        b.x2 *= sx;
        b.y1 *= sy;
        b.y2 *= sy;
    }
}

/// 整数像素区域 (x, y, w, h), 截断到图像范围内; 退化框返回 `None`
pub fn pixel_region(b: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let clamp = |v: f32, max: u32| -> u32 {
        if v.is_nan() || v <= 0.0 {
            0
        } else {
            (v as u32).min(max)
        }
    };
    let (x1, x2) = (clamp(b.x1, width), clamp(b.x2, width));
    let (y1, y2) = (clamp(b.y1, height), clamp(b.y2, height));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

/// 按检测框裁剪原图, 零宽或零高的框被丢弃
pub fn crop_regions(image: &RgbImage, boxes: &[BBox]) -> Vec<RgbImage> {
    boxes
        .iter()
        .filter_map(|b| pixel_region(b, image.width(), image.height()))
        .map(|(x, y, w, h)| image::imageops::crop_imm(image, x, y, w, h).to_image())
        .collect()
}

pub fn draw_boxes(image: &RgbImage, boxes: &[BBox]) -> RgbImage {
    let mut canvas = image.clone();
    for b in boxes {
        let Some((x, y, w, h)) = pixel_region(b, image.width(), image.height()) else {
            continue;
        };
        let (r, g, bl) = BRIGHT_COLORS[b.class_id as usize % BRIGHT_COLORS.len()];
        let color = Rgb([r, g, bl]);
        let rect = Rect::at(x as i32, y as i32).of_size(w, h);
        draw_hollow_rect_mut(&mut canvas, rect, color);
        // 加粗一像素
        if w > 2 && h > 2 {
            let inner = Rect::at(x as i32 + 1, y as i32 + 1).of_size(w - 2, h - 2);
            draw_hollow_rect_mut(&mut canvas, inner, color);
        }
    }
    canvas
}
