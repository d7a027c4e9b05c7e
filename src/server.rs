//! 判定した路面クラスをソケットで送信するモジュール
//!
//! TCPで1クライアントだけを受け付け，路面クラスが変化したときに
//! 4バイトのリトルエンディアン整数 (クラスコード1〜6) を送信します。

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use anyhow::{Context, Result};
use log::info;

use crate::segmap::SurfaceClass;

/// 挨拶メッセージの最大長
const GREETING_MAX_LEN: usize = 1024;

/// クライアントの接続を待ち受ける構造体
pub struct RegionServer {
    listener: TcpListener,
}

impl RegionServer {
    /// 指定したアドレスにバインドします。
    ///
    /// # Args
    /// * `addr` - バインドするアドレス (例: "0.0.0.0:10006")
    ///
    /// # Return
    /// * 新たなRegionServerインスタンス
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("can't bind region server")?;
        info!("waiting for client on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// バインドしたローカルアドレスを返します。
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// クライアントの接続を1つ受け付けます。
    ///
    /// 接続後，最大1024バイトの挨拶メッセージを読み取ります。
    ///
    /// # Return
    /// * クライアントとのリンク
    pub fn accept(&self) -> Result<RegionLink> {
        let (mut stream, addr) = self.listener.accept()?;
        info!("connected by {}", addr);

        let mut buf = [0u8; GREETING_MAX_LEN];
        let n = stream.read(&mut buf)?;
        let greeting = String::from_utf8_lossy(&buf[..n]).into_owned();
        info!("greeting: {:?} ({} bytes)", greeting, n);

        Ok(RegionLink {
            stream,
            greeting,
            last_sent: None,
        })
    }
}

/// 接続済みクライアントとのリンクを保持する構造体
pub struct RegionLink {
    stream: TcpStream,
    /// 接続時に受信した挨拶メッセージ
    greeting: String,
    /// 最後に送信したクラス
    last_sent: Option<SurfaceClass>,
}

impl RegionLink {
    /// 接続時に受信した挨拶メッセージを返します。
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// 路面クラスをクライアントに送信します。
    ///
    /// 前回送信したクラスから変化したときだけ送信します。
    /// 背景クラスは送信しません。
    ///
    /// # Args
    /// * `class` - 判定された路面クラス
    ///
    /// # Return
    /// * 実際に送信したかどうか
    pub fn send_region(&mut self, class: SurfaceClass) -> Result<bool> {
        if class == SurfaceClass::Background {
            return Ok(false);
        }
        if self.last_sent == Some(class) {
            return Ok(false);
        }

        self.stream.write_all(&class.code().to_le_bytes())?;
        self.stream.flush()?;
        self.last_sent = Some(class);
        info!("region changed: {} ({})", class.label(), class.code());
        Ok(true)
    }
}
