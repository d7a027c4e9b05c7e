//! DeepLabv3+ のセグメンテーションモデルをコントロールするモジュール

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use flate2::read::GzDecoder;
use image::RgbImage;
use log::{info, warn};
use tar::Archive;
use tract_onnx::prelude::*;

use crate::img_proc;
use crate::segmap::{SegmentationMap, PALETTE};

type SegPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// チェックポイントに付随する学習メタデータ
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMeta {
    /// 学習済みエポック数
    pub epoch: i64,
    /// 学習時のベストスコア (mIoU)
    pub best_pred: f64,
}

/// 展開済みのチェックポイントを保持する構造体
#[derive(Debug)]
pub struct Checkpoint {
    /// ONNX形式のモデルデータ
    pub model: Vec<u8>,
    /// 学習メタデータ (meta.jsonがない場合はNone)
    pub meta: Option<CheckpointMeta>,
}

impl Checkpoint {
    /// gzipアーカイブからチェックポイントを読み込みます。
    ///
    /// # Args
    /// * `path` - チェックポイント (tar.gz) へのパス
    ///
    /// # 注意
    /// * ファイル名が "model" で始まり ".onnx" で終わる場合、モデルデータとして解釈されます。
    /// * ファイル名が "meta.json" の場合、学習メタデータとして解釈されます。
    /// * それ以外のファイル名の場合、警告がログに出力され、そのファイルは無視されます。
    ///
    /// # Return
    /// * 新たなCheckpointインスタンス
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("no checkpoint found at '{}'", path.display()))?;
        let mut archive = Archive::new(GzDecoder::new(file));

        let mut model = None;
        let mut meta = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .file_name()
                .and_then(|n| n.to_str())
                .map(String::from)
                .unwrap_or_default();

            if name.starts_with("model") && name.ends_with(".onnx") {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                model = Some(buf);
            } else if name == "meta.json" {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                let v: serde_json::Value = serde_json::from_str(&buf)
                    .with_context(|| format!("can't parse meta.json in '{}'", path.display()))?;
                meta = Some(CheckpointMeta {
                    epoch: v["epoch"].as_i64().context("meta.json: epoch not found")?,
                    best_pred: v["best_pred"]
                        .as_f64()
                        .context("meta.json: best_pred not found")?,
                });
            } else {
                warn!("unknown checkpoint entry: {}", name);
            }
        }

        match model {
            Some(model) => Ok(Self { model, meta }),
            None => bail!("no model found in checkpoint '{}'", path.display()),
        }
    }
}

/// DeepLabv3+ のモデルをコントロールする構造体
pub struct DeepLabV3 {
    plan: SegPlan,
    cls_num: usize,
    model_width: u32,
    model_height: u32,
}

impl DeepLabV3 {
    /// 新しい `DeepLabV3` インスタンスを作成します。
    ///
    /// # Args
    /// * `checkpoint_path` - チェックポイント (tar.gz) へのパス
    /// * `cls_num` - クラス数 (背景を含む)
    /// * `model_width` - モデル入力の幅
    /// * `model_height` - モデル入力の高さ
    ///
    /// # Return
    /// * 新たな `DeepLabV3` インスタンス
    pub fn new<P: AsRef<Path>>(
        checkpoint_path: P,
        cls_num: usize,
        model_width: u32,
        model_height: u32,
    ) -> Result<Self> {
        ensure!(
            cls_num > 0 && cls_num <= PALETTE.len(),
            "cls_num out of range: {}",
            cls_num
        );

        let path = checkpoint_path.as_ref();
        let checkpoint = Checkpoint::read(path)?;

        let plan = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(&checkpoint.model))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, model_height as usize, model_width as usize),
                ),
            )?
            .into_optimized()?
            .into_runnable()?;

        match &checkpoint.meta {
            Some(meta) => info!(
                "loaded checkpoint '{}' (epoch: {}, best_pred: {})",
                path.display(),
                meta.epoch,
                meta.best_pred
            ),
            None => info!("loaded checkpoint '{}' (no meta)", path.display()),
        }

        Ok(Self {
            plan,
            cls_num,
            model_width,
            model_height,
        })
    }

    /// クラス数を返します。
    pub fn cls_num(&self) -> usize {
        self.cls_num
    }

    /// モデル入力のサイズを返します。
    pub fn model_size(&self) -> (u32, u32) {
        (self.model_width, self.model_height)
    }

    /// 1フレームを推論し，ピクセルごとのクラスマップを返します。
    ///
    /// # Args
    /// * `img` - 入力画像
    ///
    /// # Return
    /// * モデル入力サイズのSegmentationMap
    pub fn predict(&self, img: &RgbImage) -> Result<SegmentationMap> {
        let (w, h) = (self.model_width as usize, self.model_height as usize);
        let input = img_proc::to_model_input(img, self.model_width, self.model_height)?;

        let tensor: Tensor = tract_ndarray::Array4::from_shape_vec((1, 3, h, w), input)?.into();
        let result = self.plan.run(tvec!(tensor.into()))?;

        let output = result[0]
            .to_array_view::<f32>()?
            .into_dimensionality::<tract_ndarray::Ix4>()?;
        let shape = output.shape();
        ensure!(
            shape[0] == 1 && shape[1] >= self.cls_num && shape[2] == h && shape[3] == w,
            "unexpected model output shape: {:?}",
            shape
        );

        // クラス軸のargmaxでクラスマップを作る
        let mut classes = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut best = 0usize;
                let mut best_score = f32::NEG_INFINITY;
                for c in 0..self.cls_num {
                    let score = output[[0, c, y, x]];
                    if score > best_score {
                        best_score = score;
                        best = c;
                    }
                }
                classes[y * w + x] = best as u8;
            }
        }

        SegmentationMap::new(classes, self.model_width, self.model_height)
    }

    /// 1フレームを推論し，元画像サイズにデコードしたセグメンテーション画像を返します。
    ///
    /// # Args
    /// * `img` - 入力画像
    ///
    /// # Return
    /// * パレット色で塗られたRGB画像 (入力画像と同じサイズ)
    pub fn predict_decoded(&self, img: &RgbImage) -> Result<RgbImage> {
        let segmap = self.predict(img)?;
        Ok(segmap.decode_resized(img.width(), img.height()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_checkpoint(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let gz = GzEncoder::new(file.reopen().unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        file
    }

    #[test]
    fn checkpoint_reads_model_and_meta() {
        let meta = br#"{"epoch": 118, "best_pred": 0.77}"#;
        let file = write_checkpoint(&[
            ("model.onnx", b"onnx-bytes"),
            ("meta.json", meta),
            ("notes.txt", b"ignored"),
        ]);

        let ckpt = Checkpoint::read(file.path()).unwrap();
        assert_eq!(ckpt.model, b"onnx-bytes");
        let meta = ckpt.meta.unwrap();
        assert_eq!(meta.epoch, 118);
        assert!((meta.best_pred - 0.77).abs() < 1e-9);
    }

    #[test]
    fn checkpoint_without_model_is_error() {
        let file = write_checkpoint(&[("meta.json", br#"{"epoch": 1, "best_pred": 0.5}"#)]);
        assert!(Checkpoint::read(file.path()).is_err());
    }

    #[test]
    fn missing_checkpoint_is_error() {
        let err = Checkpoint::read("/no/such/checkpoint.tar.gz").unwrap_err();
        assert!(format!("{:#}", err).contains("no checkpoint found"));
    }
}
