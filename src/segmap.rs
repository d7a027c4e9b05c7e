//! セグメンテーションの結果を処理するモジュール

use anyhow::{bail, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};

/// 路面クラスのカラーパレット (背景を含む7クラス)
pub const PALETTE: [[u8; 3]; 7] = [
    [0, 0, 0],       // background
    [255, 128, 0],   // bike_lane
    [255, 0, 0],     // caution_zone
    [255, 0, 255],   // crosswalk
    [255, 255, 0],   // guide_block
    [0, 0, 255],     // roadway
    [0, 255, 0],     // sidewalk
];

/// 路面クラスを表す列挙型
///
/// 値はソケットで送信するクラスコードと一致します。
/// `Background` はコード0で，ソケットでは送信されません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceClass {
    Background = 0,
    BikeLane = 1,
    CautionZone = 2,
    Crosswalk = 3,
    GuideBlock = 4,
    Roadway = 5,
    Sidewalk = 6,
}

impl SurfaceClass {
    /// クラスコード (1〜6，背景は0) を返します。
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// クラスのラベル文字列を返します。
    pub fn label(&self) -> &'static str {
        match self {
            SurfaceClass::Background => "background",
            SurfaceClass::BikeLane => "bike lane",
            SurfaceClass::CautionZone => "caution zone",
            SurfaceClass::Crosswalk => "crosswalk",
            SurfaceClass::GuideBlock => "guide block",
            SurfaceClass::Roadway => "roadway",
            SurfaceClass::Sidewalk => "sidewalk",
        }
    }

    /// パレット上の表示色を返します。
    pub fn color(&self) -> Rgb<u8> {
        Rgb(PALETTE[*self as usize])
    }

    /// クラスインデックスから新しいSurfaceClassを作成します。
    ///
    /// # Args
    /// * `idx` - クラスインデックス (0〜6)
    ///
    /// # Return
    /// * 対応するSurfaceClass
    pub fn from_index(idx: u8) -> Result<Self> {
        let c = match idx {
            0 => SurfaceClass::Background,
            1 => SurfaceClass::BikeLane,
            2 => SurfaceClass::CautionZone,
            3 => SurfaceClass::Crosswalk,
            4 => SurfaceClass::GuideBlock,
            5 => SurfaceClass::Roadway,
            6 => SurfaceClass::Sidewalk,
            _ => bail!("class index out of range: {}", idx),
        };
        Ok(c)
    }
}

/// モデルが出力したピクセルごとのクラスマップを保持する構造体
#[derive(Debug, Clone)]
pub struct SegmentationMap {
    /// クラスインデックス (行優先，width * height 要素)
    classes: Vec<u8>,
    /// マップの幅
    width: u32,
    /// マップの高さ
    height: u32,
}

impl SegmentationMap {
    /// 新しいSegmentationMapを作成します。
    ///
    /// # Args
    /// * `classes` - ピクセルごとのクラスインデックス (行優先)
    /// * `width` - マップの幅
    /// * `height` - マップの高さ
    ///
    /// # Return
    /// * 新たなSegmentationMapインスタンス
    pub fn new(classes: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if classes.len() != (width * height) as usize {
            bail!(
                "class map size mismatch: {} != {}x{}",
                classes.len(),
                width,
                height
            );
        }
        if let Some(&c) = classes.iter().find(|&&c| c as usize >= PALETTE.len()) {
            bail!("class index out of range: {}", c);
        }
        Ok(Self {
            classes,
            width,
            height,
        })
    }

    /// マップの幅を返します。
    pub fn width(&self) -> u32 {
        self.width
    }

    /// マップの高さを返します。
    pub fn height(&self) -> u32 {
        self.height
    }

    /// 指定したピクセルのクラスインデックスを返します。
    pub fn class_at(&self, x: u32, y: u32) -> u8 {
        self.classes[(y * self.width + x) as usize]
    }

    /// クラスマップをカラーパレットでRGB画像にデコードします。
    ///
    /// # Return
    /// * パレット色で塗られたRGB画像 (マップと同じサイズ)
    pub fn decode(&self) -> RgbImage {
        let mut img = RgbImage::new(self.width, self.height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let idx = self.classes[(y * self.width + x) as usize];
            *pixel = Rgb(PALETTE[idx as usize]);
        }
        img
    }

    /// クラスマップをデコードし，指定したサイズにリサイズします。
    ///
    /// クラス境界を保つため，補間はニアレストネイバーで行います。
    ///
    /// # Args
    /// * `width` - リサイズ後の幅
    /// * `height` - リサイズ後の高さ
    ///
    /// # Return
    /// * リサイズされたRGB画像
    pub fn decode_resized(&self, width: u32, height: u32) -> RgbImage {
        if width == self.width && height == self.height {
            return self.decode();
        }
        let decoded = DynamicImage::ImageRgb8(self.decode());
        decoded
            .resize_exact(width, height, FilterType::Nearest)
            .to_rgb8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_class_codes_match_palette_order() {
        for idx in 0..PALETTE.len() as u8 {
            let c = SurfaceClass::from_index(idx).unwrap();
            assert_eq!(c.code(), u32::from(idx));
            assert_eq!(c.color(), Rgb(PALETTE[idx as usize]));
        }
        assert!(SurfaceClass::from_index(7).is_err());
    }

    #[test]
    fn decode_paints_palette_colors() {
        let map = SegmentationMap::new(vec![0, 1, 5, 6], 2, 2).unwrap();
        let img = map.decode();
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([255, 128, 0]));
        assert_eq!(img.get_pixel(0, 1), &Rgb([0, 0, 255]));
        assert_eq!(img.get_pixel(1, 1), &Rgb([0, 255, 0]));
    }

    #[test]
    fn decode_resized_keeps_class_colors() {
        // 2倍に拡大しても中間色は現れない
        let map = SegmentationMap::new(vec![3, 3, 3, 3], 2, 2).unwrap();
        let img = map.decode_resized(4, 4);
        assert_eq!(img.dimensions(), (4, 4));
        for p in img.pixels() {
            assert_eq!(p, &Rgb([255, 0, 255]));
        }
    }

    #[test]
    fn new_rejects_bad_maps() {
        assert!(SegmentationMap::new(vec![0; 3], 2, 2).is_err());
        assert!(SegmentationMap::new(vec![7; 4], 2, 2).is_err());
    }
}
