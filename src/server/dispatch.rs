//! Command dispatch: binds protocol commands to the speech service.

use tracing::debug;

use super::protocol::{Command, Request, Response};
use crate::speech::SpeechService;

/// Handle one request line. Never fails: every problem becomes an
/// `ok: false` response.
pub async fn handle_line(service: &SpeechService, line: &str) -> (Response, bool) {
    let request = match Request::parse(line) {
        Ok(r) => r,
        Err(e) => return (e.into(), true),
    };
    let reply = request.reply;
    let response = match Command::try_from(&request) {
        Ok(command) => dispatch(service, &request.cmd, command).await,
        Err(e) => e.into(),
    };
    (response, reply)
}

/// Run one command. `cmd` is echoed back as sent.
pub async fn dispatch(service: &SpeechService, cmd: &str, command: Command) -> Response {
    debug!(cmd, "Dispatching");
    match command {
        Command::Ping => Response::ok(cmd),

        Command::GetState => Response::ok(cmd).merge(service.state()),

        Command::SetVoice { voice } => match service.set_voice(&voice) {
            Ok(()) => Response::ok(cmd).with("voice", voice),
            Err(e) => Response::error(e),
        },

        Command::Speak { text } => match service.speak(&text) {
            Ok(accepted) => Response::ok(cmd).with("accepted", accepted),
            Err(e) => Response::error(e),
        },

        Command::Play {
            path,
            override_current,
            delete_after,
        } => match service
            .play_file(&path, delete_after, override_current)
            .await
        {
            Ok(()) => Response::ok(cmd),
            Err(e) => Response::error(e),
        },

        Command::BeginStream { id } => match service.begin_stream(id).await {
            Ok(id) => Response::ok(cmd).with("stream_id", id),
            Err(e) => Response::error(e),
        },

        Command::StreamPush { id, text } => match service.stream_push(&id, &text).await {
            Ok(units) => Response::ok(cmd).with("units", units),
            Err(e) => Response::error(e),
        },

        Command::StreamFinish { id } => match service.stream_finish(&id).await {
            Ok(()) => Response::ok(cmd),
            Err(e) => Response::error(e),
        },

        Command::StreamAbort { id } => match service.stream_abort(&id) {
            Ok(()) => Response::ok(cmd),
            Err(e) => Response::error(e),
        },

        Command::StreamStatus { id } => {
            let status = service.stream_status(&id);
            Response::ok(cmd).with("stream_id", id).merge(status)
        }

        Command::StopAll => {
            service.stop_all();
            Response::ok(cmd)
        }

        Command::StopAndClear => {
            service.stop_and_clear().await;
            Response::ok(cmd)
        }
    }
}
