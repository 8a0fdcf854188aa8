//! Mapper de wordcount: `wc-mapper <índice de split> <contenido>`.
//! Emite (palabra, 1) por cada palabra del split.

use common::channel::ChannelSettings;
use common::program::emit_pairs;
use common::wordcount::tokenize;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let (Some(index), Some(content)) = (args.next(), args.next()) else {
        eprintln!("uso: wc-mapper <split> <contenido>");
        return ExitCode::from(2);
    };

    let pairs = tokenize(&content);
    if let Err(e) = emit_pairs(pairs, &ChannelSettings::default()).await {
        eprintln!("wc-mapper (split {}): {}", index, e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
