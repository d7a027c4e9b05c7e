//! JPEGフォルダ，MJPEGファイル，またはカメラのフレームを推論するデモ
//!
//! フレームごとにセグメンテーション→オーバーレイ→路面クラス判定を行い，
//! 判定したクラスコードをTCPクライアントに送信します。

use anyhow::{anyhow, bail, Context, Result};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use log::info;
use v4l::buffer::Type;
use v4l::io::{mmap::Stream, traits::CaptureStream};
use v4l::video::Capture;
use v4l::{Device, FourCC};
use zune_jpeg::JpegDecoder;

use deeplab_v3_surface::deeplab::DeepLabV3;
use deeplab_v3_surface::frame_source::{FrameSource, JpgDirSource, MjpegFileSource};
use deeplab_v3_surface::segmap::SurfaceClass;
use deeplab_v3_surface::server::{RegionLink, RegionServer};
use deeplab_v3_surface::{img_proc, region};

// ### RUN OPTIONS ###
const MODEL_PATH: &str = "./run/surface/deeplab/model_iou_77.tar.gz";
const MODEL_WIDTH: u32 = 300;
const MODEL_HEIGHT: u32 = 300;
const NUM_CLASSES: usize = 7; // 背景を含む

const MODE: &str = "cam"; // "cam", "jpg" or "mjpeg"
const DATA_PATH: &str = "./input/jpgs"; // MODEが"jpg"ならフォルダ，"mjpeg"ならファイル
const OUTPUT_PATH: &str = "./output/jpgs";
// const MODE: &str = "mjpeg";
// const DATA_PATH: &str = "./input/street.mjpeg";
// const OUTPUT_PATH: &str = "./output/street.mjpeg";

const OVERLAPPING: bool = true; // セグメンテーション画像と元画像を合成するか
const FPS_OVERRIDE: Option<u64> = Some(60); // Noneならフレームを間引かない

const BIND_ADDR: &str = "0.0.0.0:10006";

const CAM_DEVICE_INDEX: usize = 0;
const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
// ######

fn main() -> Result<()> {
    env_logger::init();

    // クライアントの接続を待ってからモデルを読み込む
    let server = RegionServer::bind(BIND_ADDR)?;
    let mut link = server.accept()?;

    info!("loading model...");
    let model = DeepLabV3::new(MODEL_PATH, NUM_CLASSES, MODEL_WIDTH, MODEL_HEIGHT)?;

    match MODE {
        "cam" => run_camera(&model, &mut link),
        "jpg" => {
            let source = JpgDirSource::new(DATA_PATH, Some(OUTPUT_PATH))?;
            run_frames(&model, &mut link, Box::new(source))
        }
        "mjpeg" => {
            let source = MjpegFileSource::new(DATA_PATH, Some(OUTPUT_PATH))?;
            run_frames(&model, &mut link, Box::new(source))
        }
        _ => bail!("MODE should be \"cam\", \"jpg\" or \"mjpeg\"."),
    }
}

/// 1フレームを推論し，結果画像と判定クラスを返します。
fn process_frame(model: &DeepLabV3, img: &RgbImage) -> Result<(RgbImage, SurfaceClass)> {
    let segvis = model.predict_decoded(img)?;

    let mut result = if OVERLAPPING {
        img_proc::blend_overlay(img, &segvis)?
    } else {
        segvis
    };

    let class = region::classify_center(&result)?;
    img_proc::draw_sample_window(&mut result, 2.);
    img_proc::draw_class_swatch(&mut result, class, 24);

    Ok((result, class))
}

/// フレームソースの全フレームを順番に処理します。
fn run_frames(
    model: &DeepLabV3,
    link: &mut RegionLink,
    mut source: Box<dyn FrameSource>,
) -> Result<()> {
    let total = source.len();
    let mut index = 0;

    while let Some(img) = source.next_frame()? {
        let start = Instant::now();
        let (result, class) = process_frame(model, &img)?;

        let t = start.elapsed().as_secs_f64() * 1000.0;
        println!(
            "[{}/{}] {}: {:.03}ms, {:.1}FPS",
            index + 1,
            total,
            class.label(),
            t,
            1000. / t
        );

        source.write(&result)?;
        link.send_region(class)?;
        index += 1;

        if let Some(fps) = FPS_OVERRIDE {
            let budget = Duration::from_millis(1000 / fps);
            if let Some(rest) = budget.checked_sub(start.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    source.close()?;
    println!("Done.");
    Ok(())
}

/// カメラのフレームを処理し続けます。
fn run_camera(model: &DeepLabV3, link: &mut RegionLink) -> Result<()> {
    let loader = CamImgLoader::new(CAM_DEVICE_INDEX, FRAME_WIDTH, FRAME_HEIGHT);
    std::fs::create_dir_all(OUTPUT_PATH)?;

    let mut index = 0u64;
    loop {
        let start = Instant::now();
        let img = loader.receive()?;
        let (result, class) = process_frame(model, &img)?;

        let t = start.elapsed().as_secs_f64() * 1000.0;
        println!("{}: {:.03}ms, {:.1}FPS", class.label(), t, 1000. / t);

        result.save(format!("{}/frame_{:06}.jpg", OUTPUT_PATH, index))?;
        link.send_region(class)?;
        index += 1;
    }
}

/// カメラスレッドへのコマンド
enum CamCmd {
    Start,
    Stop,
}

/// カメラ画像を取得するための構造体
struct CamImgLoader {
    /// スレッドハンドル
    thread_handle: Option<thread::JoinHandle<()>>,
    /// start, stopなどコマンドのsender
    cmd_tx: mpsc::Sender<CamCmd>,
    /// カメラ画像のreceiver
    cam_img_rx: mpsc::Receiver<RgbImage>,
}

impl CamImgLoader {
    /// コンストラクタ
    fn new(cam_device_index: usize, frame_width: u32, frame_height: u32) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (cam_img_tx, cam_img_rx) = mpsc::channel();

        // 推論中にもカメラのバッファを更新する必要があるため，マルチスレッドでカメラだけ動かしておく
        // 動かしておかないと (推論の実行時間) * (カメラのバッファ数: 3) 秒前の画像になる
        let thread_handle = Some(thread::spawn(move || {
            let _ = Self::run_cam_thread(
                cam_device_index,
                cmd_rx,
                cam_img_tx,
                frame_width,
                frame_height,
            );
        }));
        Self {
            thread_handle,
            cmd_tx,
            cam_img_rx,
        }
    }

    /// スレッドの中身
    fn run_cam_thread(
        cam_device_index: usize,
        cmd_rx: mpsc::Receiver<CamCmd>,
        cam_img_tx: mpsc::Sender<RgbImage>,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<()> {
        // カメラデバイスをOpen
        let mut dev = Device::new(cam_device_index)?;

        // カメラのフォーマットを設定
        let mut fmt = dev.format()?;
        fmt.width = frame_width;
        fmt.height = frame_height;
        fmt.fourcc = FourCC::new(b"MJPG");
        dev.set_format(&fmt)?;

        let mut cam_stream = Stream::with_buffers(&mut dev, Type::VideoCapture, 3)?;

        loop {
            let (frame, _meta) = CaptureStream::next(&mut cam_stream)?;

            // コマンドの待機
            if let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    CamCmd::Stop => break,
                    CamCmd::Start => {
                        let mut decoder = JpegDecoder::new(frame);
                        let pixels = decoder
                            .decode()
                            .map_err(|e| anyhow!("can't decode camera frame: {:?}", e))?;
                        let info = decoder.info().context("no camera frame info")?;
                        let img =
                            RgbImage::from_raw(info.width as u32, info.height as u32, pixels)
                                .context("camera frame size mismatch")?;
                        cam_img_tx.send(img)?;
                    }
                }
            }
            thread::yield_now();
        }
        Ok(())
    }

    /// 画像の取得を開始します。
    pub fn start(&self) -> Result<()> {
        // スレッドが停止していないか？
        if self.thread_handle.is_some() {
            self.cmd_tx.send(CamCmd::Start)?;
        }
        Ok(())
    }

    /// 画像をスレッドから受信します。
    pub fn receive(&self) -> Result<RgbImage> {
        self.start()?;
        Ok(self.cam_img_rx.recv()?)
    }

    /// スレッドを停止します。
    pub fn stop(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            self.cmd_tx.send(CamCmd::Stop)?;

            // スレッドをjoin
            let j = self
                .thread_handle
                .take()
                .context("Can't take thread_handle")?
                .join();
            if j.is_err() {
                bail!("Can't join thread");
            }
        }
        Ok(())
    }
}

impl Drop for CamImgLoader {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
