//! JPEGフォルダの全フレームをまとめて推論するデモ

use anyhow::Result;
use std::time::Instant;

use deeplab_v3_surface::deeplab::DeepLabV3;
use deeplab_v3_surface::frame_source::{FrameSource, JpgDirSource};
use deeplab_v3_surface::{img_proc, region};

fn main() -> Result<()> {
    env_logger::init();

    // チェックポイントのパス
    let model_path = "./run/surface/deeplab/model_iou_77.tar.gz";

    // モデルを初期化
    let model = DeepLabV3::new(model_path, 7, 300, 300)?;

    // 入力フォルダと出力フォルダ
    let mut source = JpgDirSource::new("./input/jpgs", Some("./output/jpgs"))?;
    println!("{} frames", source.len());

    while let Some(img) = source.next_frame()? {
        let start = Instant::now();

        // セグメンテーションとオーバーレイ合成
        let segvis = model.predict_decoded(&img)?;
        let result = img_proc::blend_overlay(&img, &segvis)?;

        // 中央領域から路面クラスを判定
        let class = region::classify_center(&result)?;

        let end = start.elapsed();
        let t = end.as_secs_f64() * 1000.0;
        println!("{}: {:.03}ms, {:.1}FPS", class.label(), t, 1000. / t);

        source.write(&result)?;
    }
    source.close()?;

    Ok(())
}
