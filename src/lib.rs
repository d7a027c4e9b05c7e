//! # DeepLabv3+ 路面セグメンテーション推論ライブラリ
//!
//! このクレートは、学習済みDeepLabv3+モデルで路面のセマンティックセグメンテーションを
//! リアルタイムに実行するためのRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **チェックポイントの読み込み**: 学習済みモデル (tar.gz) とメタデータを読み込みます。
//! 2. **フレームのセグメンテーション**: 1フレームごとにクラスマップを推論し、カラーパレットで可視化します。
//! 3. **オーバーレイ合成**: セグメンテーション画像と元フレームをアルファ0.5で合成します。
//! 4. **路面クラス判定**: 画像中央の平均色から路面クラス (自転車道、横断歩道など) を判定します。
//! 5. **ソケット送信**: 判定したクラスコードをTCPで接続したクライアントに送信します。
//!
//! ## Example
//! ```no_run
//! # use deeplab_v3_surface::deeplab::DeepLabV3;
//! # use deeplab_v3_surface::{img_proc, region};
//! # fn main() -> anyhow::Result<()> {
//! let model = DeepLabV3::new("./run/surface/deeplab/model_iou_77.tar.gz", 7, 300, 300)?;
//! let img = image::open("./input/jpgs/image.jpg")?.to_rgb8();
//! let segvis = model.predict_decoded(&img)?;
//! let result = img_proc::blend_overlay(&img, &segvis)?;
//! let class = region::classify_center(&result)?;
//! println!("{}", class.label());
//! # Ok(())
//! # }
//! ```

pub mod deeplab;
pub mod frame_source;
pub mod img_proc;
pub mod region;
pub mod segmap;
pub mod server;
