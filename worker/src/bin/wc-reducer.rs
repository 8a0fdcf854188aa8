//! Reducer de wordcount: recibe (palabra, [1, 1, ...]) y devuelve (palabra, suma).

use common::channel::ChannelSettings;
use common::program::{emit_result, receive_group};
use common::wordcount::sum_values;
use common::KvPair;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let order = std::env::args().nth(1).unwrap_or_default();
    let settings = ChannelSettings::default();

    let group = match receive_group(settings.io_timeout).await {
        Ok(group) => group,
        Err(e) => {
            eprintln!("wc-reducer {}: {}", order, e);
            return ExitCode::FAILURE;
        }
    };
    let result = KvPair {
        value: sum_values(&group.value),
        key: group.key,
    };
    if let Err(e) = emit_result(&result, &settings).await {
        eprintln!("wc-reducer {}: {}", order, e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
