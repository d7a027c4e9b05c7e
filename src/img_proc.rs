//! セグメンテーションに関する画像処理モジュール

use std::num::NonZeroU32;

use anyhow::{Context, Result};
use fast_image_resize as fir;
use image::{Rgb, RgbImage};

use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::segmap::SurfaceClass;

/// 正規化に使う平均値 (ImageNet統計，RGB順)
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// 正規化に使う標準偏差 (ImageNet統計，RGB順)
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 画像をバイリニア補間でリサイズします。
///
/// # Args
/// * `img` - リサイズする画像
/// * `width` - リサイズ後の幅
/// * `height` - リサイズ後の高さ
///
/// # Return
/// * リサイズされたRGB画像
pub fn resize_bilinear(img: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    if img.dimensions() == (width, height) {
        return Ok(img.clone());
    }

    let src_w = NonZeroU32::new(img.width()).context("image width is zero")?;
    let src_h = NonZeroU32::new(img.height()).context("image height is zero")?;
    let dst_w = NonZeroU32::new(width).context("resize width is zero")?;
    let dst_h = NonZeroU32::new(height).context("resize height is zero")?;

    let src = fir::Image::from_vec_u8(src_w, src_h, img.as_raw().clone(), fir::PixelType::U8x3)?;
    let mut dst = fir::Image::new(dst_w, dst_h, fir::PixelType::U8x3);

    let mut resizer = fir::Resizer::new(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear));
    resizer.resize(&src.view(), &mut dst.view_mut())?;

    RgbImage::from_raw(width, height, dst.into_vec()).context("resize buffer size mismatch")
}

/// 画像をモデル入力データに変換します。
///
/// リサイズ後，各ピクセルを `(p / 255 - mean) / std` で正規化し，
/// CHW順 (チャネル，高さ，幅) で並べます。
///
/// # Args
/// * `img` - 入力画像
/// * `width` - モデル入力の幅
/// * `height` - モデル入力の高さ
///
/// # Return
/// * CHW順に並んだ正規化済みのf32データ (3 * height * width 要素)
pub fn to_model_input(img: &RgbImage, width: u32, height: u32) -> Result<Vec<f32>> {
    let resized = resize_bilinear(img, width, height)?;

    let plane = (width * height) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let base = (y * width + x) as usize;
        for ch in 0..3 {
            let v = pixel[ch] as f32 / 255.0;
            data[ch * plane + base] = (v - NORM_MEAN[ch]) / NORM_STD[ch];
        }
    }
    Ok(data)
}

/// 元画像とセグメンテーション画像をアルファ0.5で合成します。
///
/// サイズが異なる場合は，元画像をセグメンテーション画像のサイズに合わせます。
///
/// # Args
/// * `img` - 元画像
/// * `segvis` - デコード済みのセグメンテーション画像
///
/// # Return
/// * 合成されたRGB画像
pub fn blend_overlay(img: &RgbImage, segvis: &RgbImage) -> Result<RgbImage> {
    let (w, h) = segvis.dimensions();
    let resized = resize_bilinear(img, w, h)?;

    let mut out = RgbImage::new(w, h);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let a = resized.get_pixel(x, y);
        let b = segvis.get_pixel(x, y);
        *pixel = Rgb([
            ((a[0] as u16 + b[0] as u16) / 2) as u8,
            ((a[1] as u16 + b[1] as u16) / 2) as u8,
            ((a[2] as u16 + b[2] as u16) / 2) as u8,
        ]);
    }
    Ok(out)
}

/// 画像上に線を描画します。
///
/// # Args
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    let (bx, by) = (x1 - (thickness / 2.).floor(), y1 - (thickness / 2.).floor());

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size(w as u32, h as u32);
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に矩形を描画します。
///
/// # Args
/// * `img` - 矩形を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 矩形の左上と右下の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_rect(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    draw_line(img, x1, y1, x1, y2, thickness, color);
    draw_line(img, x1, y2, x2, y2, thickness, color);
    draw_line(img, x1, y1, x2, y1, thickness, color);
    draw_line(img, x2, y1, x2, y2, thickness, color);
}

/// 領域分類がサンプリングする中央3分の1の窓を画像上に描画します。
///
/// # Args
/// * `img` - 描画する画像 (in-place)
/// * `thickness` - 枠線の太さ
pub fn draw_sample_window(img: &mut RgbImage, thickness: f32) {
    let (w, h) = img.dimensions();
    let x1 = (w / 3) as f32;
    let y1 = (h / 3) as f32;
    let x2 = (w * 2 / 3) as f32;
    let y2 = (h * 2 / 3) as f32;
    draw_rect(img, x1, y1, x2, y2, thickness, Rgb([255, 255, 255]));
}

/// 判定された路面クラスの色見本を画像の左上に描画します。
///
/// # Args
/// * `img` - 描画する画像 (in-place)
/// * `class` - 判定された路面クラス
/// * `size` - 見本の一辺の長さ
pub fn draw_class_swatch(img: &mut RgbImage, class: SurfaceClass, size: u32) {
    let rect = Rect::at(0, 0).of_size(size, size);
    draw_filled_rect_mut(img, rect, class.color());

    // 背景と区別できるように白枠を付ける
    draw_rect(img, 0., 0., size as f32, size as f32, 1., Rgb([255, 255, 255]));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_input_normalizes_channels() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 128]));
        let data = to_model_input(&img, 4, 4).unwrap();
        assert_eq!(data.len(), 3 * 16);

        let r = (1.0 - NORM_MEAN[0]) / NORM_STD[0];
        let g = (0.0 - NORM_MEAN[1]) / NORM_STD[1];
        let b = (128. / 255. - NORM_MEAN[2]) / NORM_STD[2];
        assert!((data[0] - r).abs() < 1e-5);
        assert!((data[16] - g).abs() < 1e-5);
        assert!((data[32] - b).abs() < 1e-5);
    }

    #[test]
    fn resize_keeps_flat_color() {
        let img = RgbImage::from_pixel(8, 8, Rgb([10, 200, 30]));
        let resized = resize_bilinear(&img, 4, 4).unwrap();
        assert_eq!(resized.dimensions(), (4, 4));
        for p in resized.pixels() {
            assert_eq!(p, &Rgb([10, 200, 30]));
        }
    }

    #[test]
    fn blend_is_mean_of_inputs() {
        let a = RgbImage::from_pixel(2, 2, Rgb([100, 0, 50]));
        let b = RgbImage::from_pixel(2, 2, Rgb([200, 50, 50]));
        let out = blend_overlay(&a, &b).unwrap();
        for p in out.pixels() {
            assert_eq!(p, &Rgb([150, 25, 50]));
        }
    }

    #[test]
    fn swatch_paints_class_color() {
        let mut img = RgbImage::new(32, 32);
        draw_class_swatch(&mut img, SurfaceClass::Roadway, 8);
        assert_eq!(img.get_pixel(4, 4), &Rgb([0, 0, 255]));
    }
}
