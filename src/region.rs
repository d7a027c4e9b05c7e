//! 画像の中央領域から路面クラスを判定するモジュール

use anyhow::{ensure, Result};
use color_space::{Hsv, Rgb as CsRgb};
use image::RgbImage;
use log::debug;

use crate::segmap::SurfaceClass;

/// 平均明度 (HSVのV，0〜1) がこの値未満の窓は暗すぎるとみなし，背景扱いにする
const MIN_BRIGHTNESS: f64 = 0.05;

/// ピクセル窓のRGBと明度を累積する構造体
pub struct Region {
    pub start: (u32, u32),
    pub end: (u32, u32),
    total_brightness: f64,
    total_r: f64,
    total_g: f64,
    total_b: f64,
    pixel_count: u32,
}

impl Region {
    pub fn new(s: (u32, u32), e: (u32, u32)) -> Result<Self> {
        ensure!(
            s.0 <= e.0 && s.1 <= e.1,
            "Start coordinates must be less than or equal to end coordinates"
        );

        Ok(Self {
            start: s,
            end: e,
            total_brightness: 0.0,
            total_r: 0.0,
            total_g: 0.0,
            total_b: 0.0,
            pixel_count: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.end.0.saturating_sub(self.start.0)
    }

    pub fn height(&self) -> u32 {
        self.end.1.saturating_sub(self.start.1)
    }

    pub fn is_in(&self, p: (u32, u32)) -> bool {
        p.0 >= self.start.0 && p.1 >= self.start.1 && p.0 < self.end.0 && p.1 < self.end.1
    }

    /// ピクセルのRGB値を累積します。明度はHSVに変換して求めます。
    pub fn add_rgb(&mut self, r: f64, g: f64, b: f64) {
        let hsv = Hsv::from(CsRgb::new(r, g, b));
        self.total_r += r;
        self.total_g += g;
        self.total_b += b;
        self.total_brightness += hsv.v;
        self.pixel_count += 1;
    }

    pub fn avg_brightness(&self) -> f64 {
        if self.pixel_count == 0 {
            0.0
        } else {
            self.total_brightness / self.pixel_count as f64
        }
    }

    pub fn avg_rgb(&self) -> (f64, f64, f64) {
        if self.pixel_count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (
                self.total_r / self.pixel_count as f64,
                self.total_g / self.pixel_count as f64,
                self.total_b / self.pixel_count as f64,
            )
        }
    }
}

/// 平均RGB値から路面クラスを判定します。
///
/// しきい値は互いに重なり得るため，先に一致したルールを採用します。
/// どのルールにも一致しない場合は背景を返します。
///
/// # Args
/// * `r`, `g`, `b` - 窓内の平均RGB値 (0〜255)
///
/// # Return
/// * 判定された路面クラス
pub fn classify_avg_rgb(r: f64, g: f64, b: f64) -> SurfaceClass {
    if r > 155. && g > 100. && g < 155. {
        SurfaceClass::BikeLane
    } else if r > 155. && g < 100. && b < 100. {
        SurfaceClass::CautionZone
    } else if r > 155. && g < 100. && b > 155. {
        SurfaceClass::Crosswalk
    } else if r > 155. && g > 155. && b < 155. {
        SurfaceClass::GuideBlock
    } else if r < 100. && g < 100. && b > 155. {
        SurfaceClass::Roadway
    } else if r < 100. && g > 120. && b < 100. {
        SurfaceClass::Sidewalk
    } else {
        SurfaceClass::Background
    }
}

/// 指定した窓の平均色から路面クラスを判定します。
///
/// # Args
/// * `img` - 判定する画像
/// * `region` - サンプリングする窓 (in-place で累積に使用)
///
/// # Return
/// * 判定された路面クラス
pub fn classify_region(img: &RgbImage, region: &mut Region) -> SurfaceClass {
    for y in region.start.1..region.end.1.min(img.height()) {
        for x in region.start.0..region.end.0.min(img.width()) {
            let p = img.get_pixel(x, y);
            region.add_rgb(p[0] as f64, p[1] as f64, p[2] as f64);
        }
    }

    let (r, g, b) = region.avg_rgb();
    let v = region.avg_brightness();
    debug!("avg rgb: ({:.1}, {:.1}, {:.1}), brightness: {:.3}", r, g, b, v);

    // ほぼ真っ暗な窓はしきい値判定しない
    if v < MIN_BRIGHTNESS {
        return SurfaceClass::Background;
    }
    classify_avg_rgb(r, g, b)
}

/// 画像の中央3分の1の平均色から路面クラスを判定します。
///
/// # Args
/// * `img` - 判定する画像
///
/// # Return
/// * 判定された路面クラス
pub fn classify_center(img: &RgbImage) -> Result<SurfaceClass> {
    let (w, h) = img.dimensions();
    let mut region = Region::new((w / 3, h / 3), (w * 2 / 3, h * 2 / 3))?;
    Ok(classify_region(img, &mut region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmap::PALETTE;
    use image::Rgb;

    #[test]
    fn thresholds_match_palette_colors() {
        // パレットの純色はそのクラスに判定される
        let expect = [
            (1, SurfaceClass::BikeLane),
            (2, SurfaceClass::CautionZone),
            (3, SurfaceClass::Crosswalk),
            (4, SurfaceClass::GuideBlock),
            (5, SurfaceClass::Roadway),
            (6, SurfaceClass::Sidewalk),
        ];
        for (idx, class) in expect {
            let [r, g, b] = PALETTE[idx];
            assert_eq!(classify_avg_rgb(r as f64, g as f64, b as f64), class);
        }
    }

    #[test]
    fn unmatched_color_is_background() {
        assert_eq!(classify_avg_rgb(120., 120., 120.), SurfaceClass::Background);
        assert_eq!(classify_avg_rgb(0., 0., 0.), SurfaceClass::Background);
    }

    #[test]
    fn blended_overlay_color_still_matches() {
        // パレット色と路面のグレーを0.5で合成した色でも判定できる
        // bike_lane [255,128,0] と [128,128,128] の合成
        assert_eq!(classify_avg_rgb(191., 128., 64.), SurfaceClass::BikeLane);
        // roadway [0,0,255] と [128,128,128] の合成
        assert_eq!(classify_avg_rgb(64., 64., 191.), SurfaceClass::Roadway);
    }

    #[test]
    fn center_window_ignores_border() {
        // 周辺は歩道色，中央は車道色の画像
        let mut img = RgbImage::from_pixel(90, 90, Rgb([0, 255, 0]));
        for y in 30..60 {
            for x in 30..60 {
                img.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }
        assert_eq!(classify_center(&img).unwrap(), SurfaceClass::Roadway);
    }

    #[test]
    fn dark_window_is_background() {
        let img = RgbImage::from_pixel(30, 30, Rgb([2, 3, 2]));
        assert_eq!(classify_center(&img).unwrap(), SurfaceClass::Background);
    }

    #[test]
    fn region_accumulates_mean() {
        let mut region = Region::new((0, 0), (2, 2)).unwrap();
        region.add_rgb(10., 20., 30.);
        region.add_rgb(30., 40., 50.);
        let (r, g, b) = region.avg_rgb();
        assert_eq!((r, g, b), (20., 30., 40.));
        assert!(Region::new((5, 5), (1, 1)).is_err());
    }
}
