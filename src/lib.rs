#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph
)]

//! polatis_l1
//!
//! polatis_l1 はオーケストレーションコントローラと Polatis 光スイッチ (TL1) を橋渡しする
//! L1 ドライバです。
//!
//! 主な機能:
//! - コントローラからの XML コマンドバッチの受信・ディスパッチ・応答 (`server`)
//! - TL1 デバイスセッション: ctag (correlation counter) 付きコマンド送信と完了パターン待ち (`session`)
//! - Polatis 向けハンドラ: リソース記述、クロスコネクト操作、logical / physical ポートモード (`polatis`)
//! - テスト用のモックスイッチ (別 crate `polatis_tl1_mock`)
//!
//! 使い方の簡単な例:
//! ```no_run
//! use std::sync::Arc;
//! use polatis_l1::config::Config;
//! use polatis_l1::polatis::PolatisHandler;
//! use polatis_l1::server::{ConnectionServer, ServerOptions};
//! # async fn run() -> Result<(), polatis_l1::L1Error> {
//! let cfg = Config::default();
//! let handler = Arc::new(PolatisHandler::from_config(&cfg));
//! let server = ConnectionServer::new(handler, ServerOptions::from(&cfg));
//! server.listen(&cfg.listen_host, 4000, cfg.backlog).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handler;
pub mod polatis;
pub mod resource;
pub mod server;
pub mod session;
pub mod tl1;
pub mod toml_helpers;

pub use command::{BatchResult, CommandKind, CommandRequest, CommandResult, ResponsePayload};
pub use error::L1Error;
pub use handler::L1Handler;
pub use server::ConnectionServer;
pub use session::{Connector, DeviceSession, TcpConnector};
