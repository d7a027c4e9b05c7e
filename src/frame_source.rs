//! フレームの入出力を行うモジュール
//!
//! JPEGファイルのディレクトリ，またはMJPEGストリームファイルからRGBフレームを
//! 順番に取り出し，処理結果のフレームを書き戻します。
//! カメラからの取得はデモ側 (demos/predict.rs) で行います。

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::warn;

/// フレームを順番に供給し，処理結果を受け取るトレイト
pub trait FrameSource {
    /// 総フレーム数を返します。
    fn len(&self) -> usize;

    /// フレームが1枚もないかどうかを返します。
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 次のフレームを返します。フレームが尽きたらNoneを返します。
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// 処理結果のフレームを書き込みます。
    fn write(&mut self, img: &RgbImage) -> Result<()>;

    /// 出力を閉じます。
    fn close(&mut self) -> Result<()>;
}

/// JPEGデータをフレームごとに分割します。
///
/// SOIマーカ (FF D8 FF) からEOIマーカ (FF D9) までを1フレームとして切り出します。
///
/// # Args
/// * `data` - 連結されたJPEGデータ
///
/// # Return
/// * フレームごとのバイト範囲のベクタ
pub fn split_jpeg_frames(data: &[u8]) -> Vec<std::ops::Range<usize>> {
    let mut frames = Vec::new();
    let mut start = None;

    let mut i = 0;
    while i + 1 < data.len() {
        match (data[i], data[i + 1]) {
            (0xFF, 0xD8) if start.is_none() && i + 2 < data.len() && data[i + 2] == 0xFF => {
                start = Some(i);
                i += 2;
            }
            (0xFF, 0xD9) => {
                if let Some(s) = start.take() {
                    frames.push(s..i + 2);
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    frames
}

/// MJPEGストリームファイルを書き出す構造体
struct MjpegWriter {
    out: BufWriter<File>,
}

impl MjpegWriter {
    fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = File::create(path)
            .with_context(|| format!("can't create output file '{}'", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    fn write_frame(&mut self, img: &RgbImage) -> Result<()> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 90).encode_image(img)?;
        self.out.write_all(&buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// JPEGファイルのディレクトリをフレーム列として扱う構造体
pub struct JpgDirSource {
    /// 辞書順にソートされたJPEGファイルのパス
    files: Vec<PathBuf>,
    /// 次に読むファイルのインデックス
    index: usize,
    /// 最後に読んだファイル名 (書き込み時に使用)
    last_file_name: String,
    /// 出力先ディレクトリ
    output_folder: Option<PathBuf>,
}

impl JpgDirSource {
    /// 新しいJpgDirSourceを作成します。
    ///
    /// # Args
    /// * `jpg_folder` - JPEGファイルを含むディレクトリ
    /// * `output_folder` - 結果フレームの出力先 (Noneなら書き込みなし)
    ///
    /// # Return
    /// * 新たなJpgDirSourceインスタンス
    pub fn new<P: AsRef<Path>>(jpg_folder: P, output_folder: Option<P>) -> Result<Self> {
        let jpg_folder = jpg_folder.as_ref();
        ensure!(
            jpg_folder.is_dir(),
            "DATA_PATH should be directory including jpg files: '{}'",
            jpg_folder.display()
        );

        let mut files: Vec<PathBuf> = std::fs::read_dir(jpg_folder)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("jpg"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let output_folder = match output_folder {
            Some(dir) => {
                let dir = dir.as_ref().to_path_buf();
                std::fs::create_dir_all(&dir)?;
                Some(dir)
            }
            None => None,
        };

        Ok(Self {
            files,
            index: 0,
            last_file_name: String::new(),
            output_folder,
        })
    }
}

impl FrameSource for JpgDirSource {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;

        self.last_file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let img = image::open(path)
            .with_context(|| format!("can't read image '{}'", path.display()))?;
        Ok(Some(img.to_rgb8()))
    }

    fn write(&mut self, img: &RgbImage) -> Result<()> {
        let Some(dir) = &self.output_folder else {
            return Ok(());
        };
        if self.last_file_name.is_empty() {
            warn!("write called before next_frame, skipping");
            return Ok(());
        }
        img.save(dir.join(&self.last_file_name))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// MJPEGストリームファイルをフレーム列として扱う構造体
pub struct MjpegFileSource {
    /// ファイル全体のバイト列
    data: Vec<u8>,
    /// フレームごとのバイト範囲
    frames: Vec<std::ops::Range<usize>>,
    /// 次に読むフレームのインデックス
    index: usize,
    /// 出力先のライタ
    writer: Option<MjpegWriter>,
}

impl MjpegFileSource {
    /// 新しいMjpegFileSourceを作成します。
    ///
    /// # Args
    /// * `mjpeg_file` - MJPEGストリームファイルのパス
    /// * `output_path` - 結果ストリームの出力先 (Noneなら書き込みなし)
    ///
    /// # Return
    /// * 新たなMjpegFileSourceインスタンス
    pub fn new<P: AsRef<Path>>(mjpeg_file: P, output_path: Option<P>) -> Result<Self> {
        let path = mjpeg_file.as_ref();
        ensure!(
            path.is_file(),
            "DATA_PATH should be existing mjpeg file path: '{}'",
            path.display()
        );

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        let frames = split_jpeg_frames(&data);
        if frames.is_empty() {
            warn!("no jpeg frames found in '{}'", path.display());
        }

        let writer = match output_path {
            Some(p) => Some(MjpegWriter::create(p)?),
            None => None,
        };

        Ok(Self {
            data,
            frames,
            index: 0,
            writer,
        })
    }
}

impl FrameSource for MjpegFileSource {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(range) = self.frames.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;

        let img = image::load_from_memory(&self.data[range.clone()])?;
        Ok(Some(img.to_rgb8()))
    }

    fn write(&mut self, img: &RgbImage) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_frame(img)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for MjpegFileSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn split_finds_frames_between_markers() {
        let mut data = vec![0x00, 0x01];
        data.extend([0xFF, 0xD8, 0xFF, 0xE0, 0x12, 0x34, 0xFF, 0xD9]);
        data.extend([0xAA, 0xBB]);
        data.extend([0xFF, 0xD8, 0xFF, 0xDB, 0x56, 0xFF, 0xD9]);

        let frames = split_jpeg_frames(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(&data[frames[0].clone()][..2], &[0xFF, 0xD8]);
        assert_eq!(&data[frames[0].clone()][6..], &[0xFF, 0xD9]);
        assert_eq!(frames[1].clone().count(), 7);
    }

    #[test]
    fn split_ignores_eoi_without_soi() {
        let data = [0xFF, 0xD9, 0x00, 0xFF, 0xD9];
        assert!(split_jpeg_frames(&data).is_empty());
    }

    #[test]
    fn jpg_dir_reads_sorted_and_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]))
            .save(dir.path().join("b.jpg"))
            .unwrap();
        RgbImage::from_pixel(8, 8, Rgb([0, 255, 0]))
            .save(dir.path().join("a.jpg"))
            .unwrap();
        std::fs::write(dir.path().join("note.txt"), b"ignored").unwrap();

        let mut src =
            JpgDirSource::new(dir.path(), Some(out_dir.path())).unwrap();
        assert_eq!(src.len(), 2);

        // 辞書順なのでa.jpgが先
        let first = src.next_frame().unwrap().unwrap();
        assert_eq!(first.dimensions(), (8, 8));
        src.write(&first).unwrap();
        assert!(out_dir.path().join("a.jpg").is_file());

        let second = src.next_frame().unwrap().unwrap();
        assert_eq!(second.dimensions(), (4, 4));
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn jpg_dir_rejects_missing_dir() {
        assert!(JpgDirSource::new(Path::new("/no/such/dir"), None).is_err());
    }

    #[test]
    fn mjpeg_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.mjpeg");

        // 2フレームのストリームを書いてから読み直す
        {
            let mut writer = MjpegWriter::create(&path).unwrap();
            writer
                .write_frame(&RgbImage::from_pixel(6, 4, Rgb([10, 20, 30])))
                .unwrap();
            writer
                .write_frame(&RgbImage::from_pixel(6, 4, Rgb([40, 50, 60])))
                .unwrap();
            writer.flush().unwrap();
        }

        let mut src = MjpegFileSource::new(path, None).unwrap();
        assert_eq!(src.len(), 2);
        let f0 = src.next_frame().unwrap().unwrap();
        assert_eq!(f0.dimensions(), (6, 4));
        let f1 = src.next_frame().unwrap().unwrap();
        assert_eq!(f1.dimensions(), (6, 4));
        assert!(src.next_frame().unwrap().is_none());
    }
}
