use std::sync::Arc;

use clap::Parser;
use log::trace;

use tilestream::editor::application::EditorApplication;
use tilestream::io::fs::loader::FsLoader;
use tilestream::settings::{CliArgs, OperationMode, StreamingSettings};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    #[cfg(feature = "tracy")]
    tracy_client::Client::start();

    let args = CliArgs::parse();
    trace!("Starting with args: {:?}", args);

    let settings = StreamingSettings::from_args(&args);
    let source = Arc::new(FsLoader::new(&args.data_dir));
    let mut app = EditorApplication::new(settings, source, &args.data_dir)?;

    let result = match &args.operation_mode {
        OperationMode::Walk { map_name, from, to } => app.walk(map_name, from.0, to.0),
        OperationMode::Export { map_name, rect } => app.export(map_name, *rect),
    };

    let shutdown = app.shutdown();
    result.and(shutdown)
}
