//! Link-Chat CLI
//!
//! UDP로 에뮬레이션한 2계층 세그먼트 위에서 노드 하나를 띄운다.
//!
//! 사용법:
//!   linkchat [OPTIONS] <COMMAND>
//!
//! 예시:
//!   # 수신 대기
//!   linkchat --mac 02:00:00:00:00:0b --bind 127.0.0.1:47801 --member 127.0.0.1:47800 listen
//!
//!   # 파일 전송
//!   linkchat --mac 02:00:00:00:00:0a --bind 127.0.0.1:47800 --member 127.0.0.1:47801 \
//!       file 02:00:00:00:00:0b ./photo.jpg

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use linkchat::sender::TransferHandle;
use linkchat::{config, Event, EventReceiver, MacAddr, Node, PeerDirectory, UdpSegment};

const USAGE: &str = r#"Link-Chat - Ethernet(Layer 2) 메시지/파일/폴더 전송

사용법:
  linkchat [OPTIONS] <COMMAND>

명령:
  listen                   수신 대기 (Ctrl+C로 종료)
  text <MAC> <MESSAGE>     텍스트 메시지 전송
  file <MAC> <PATH>        파일 전송
  folder <MAC> <PATH>      폴더 전송
  discover                 피어 탐색 (브로드캐스트)

옵션:
  -c, --config <PATH>      TOML 설정 파일
  -m, --mac <MAC>          이 노드의 MAC 주소
  -b, --bind <ADDR>        세그먼트 UDP 바인드 주소 (기본: 0.0.0.0:47800)
  --member <ADDR>          세그먼트 구성원 주소 (반복 가능)
  -n, --name <NAME>        사용자 이름 (탐색 응답에 사용)
  -d, --download-dir <DIR> 수신 파일 저장 위치
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조절 (기본: info)"#;

/// 탐색 응답을 기다리는 시간
const DISCOVERY_WAIT: Duration = Duration::from_secs(3);

/// 이 시간 동안 소식이 없는 피어는 목록에서 뺀다
const PEER_TTL: Duration = Duration::from_secs(300);

enum Command {
    Listen,
    Text { dest: MacAddr, message: String },
    File { dest: MacAddr, path: PathBuf },
    Folder { dest: MacAddr, path: PathBuf },
    Discover,
}

/// 명령줄 인자
struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
    mac: Option<MacAddr>,
    bind: Option<SocketAddr>,
    members: Vec<SocketAddr>,
    name: Option<String>,
    download_dir: Option<PathBuf>,
}

fn option_value(args: &[String], i: &mut usize) -> Result<String, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} 뒤에 값이 필요함", flag))
}

fn parse_mac(s: &str) -> Result<MacAddr, String> {
    s.parse().map_err(|e: linkchat::Error| e.to_string())
}

fn parse_addr(s: &str) -> Result<SocketAddr, String> {
    s.parse().map_err(|_| format!("유효한 주소 필요: {}", s))
}

/// `None`이면 도움말 요청
fn parse_args() -> Result<Option<CliArgs>, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = None;
    let mut mac = None;
    let mut bind = None;
    let mut members = Vec::new();
    let mut name = None;
    let mut download_dir = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => config_path = Some(PathBuf::from(option_value(&args, &mut i)?)),
            "--mac" | "-m" => mac = Some(parse_mac(&option_value(&args, &mut i)?)?),
            "--bind" | "-b" => bind = Some(parse_addr(&option_value(&args, &mut i)?)?),
            "--member" => members.push(parse_addr(&option_value(&args, &mut i)?)?),
            "--name" | "-n" => name = Some(option_value(&args, &mut i)?),
            "--download-dir" | "-d" => {
                download_dir = Some(PathBuf::from(option_value(&args, &mut i)?))
            }
            "--help" | "-h" => return Ok(None),
            flag if flag.starts_with('-') && positional.is_empty() => {
                return Err(format!("알 수 없는 옵션: {}", flag));
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let command = match positional.iter().map(String::as_str).collect::<Vec<_>>()[..] {
        ["listen"] => Command::Listen,
        ["discover"] => Command::Discover,
        ["text", dest, ref words @ ..] if !words.is_empty() => Command::Text {
            dest: parse_mac(dest)?,
            message: words.join(" "),
        },
        ["file", dest, path] => Command::File {
            dest: parse_mac(dest)?,
            path: PathBuf::from(path),
        },
        ["folder", dest, path] => Command::Folder {
            dest: parse_mac(dest)?,
            path: PathBuf::from(path),
        },
        [] => return Ok(None),
        _ => return Err(format!("잘못된 명령: {}", positional.join(" "))),
    };

    Ok(Some(CliArgs {
        command,
        config_path,
        mac,
        bind,
        members,
        name,
        download_dir,
    }))
}

fn log_event(event: &Event) {
    match event {
        Event::TextReceived { from, text } => info!("[{}] {}", from, text),
        Event::TextCorrupted { from } => warn!("[{}] 손상된 텍스트", from),
        Event::FileStarted { from, name, size, .. } => {
            info!("[{}] 파일 수신 중: {} ({} bytes)", from, name, size)
        }
        Event::FileReceived {
            from,
            path,
            bytes_received,
            declared_size,
            ..
        } => {
            if bytes_received == declared_size {
                info!("[{}] 파일 저장: {:?} ({} bytes)", from, path, bytes_received);
            } else {
                warn!(
                    "[{}] 불완전한 파일: {:?} ({}/{} bytes)",
                    from, path, bytes_received, declared_size
                );
            }
        }
        Event::FileAbandoned { from, path, .. } => warn!("[{}] 중단된 파일: {:?}", from, path),
        Event::FolderStarted { from, path } => info!("[{}] 폴더: {:?}", from, path),
        Event::FolderCompleted { .. } => {}
        Event::FolderTransferCompleted { from, root } => {
            info!("[{}] 폴더 수신 완료: {:?}", from, root)
        }
        Event::PeerDiscovered { peer, username } => info!("피어: {} ({})", username, peer),
    }
}

async fn listen(events: &mut EventReceiver, peers: &PeerDirectory) {
    info!("수신 대기 중 (Ctrl+C로 종료)");
    let mut prune = tokio::time::interval(PEER_TTL / 5);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = prune.tick() => {
                let removed = peers.prune(PEER_TTL);
                if removed > 0 {
                    info!("오래된 피어 {}개 제거", removed);
                }
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            }
        }
    }
}

/// 전송 결과 대기. Ctrl+C는 취소 요청으로 바꾼다.
async fn run_transfer<T>(handle: TransferHandle<T>) -> linkchat::Result<T> {
    let canceller = handle.canceller();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("전송 취소 중...");
            canceller.cancel();
        }
    });

    let result = handle.join().await;
    watcher.abort();
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{}", USAGE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let mut config = config::load(args.config_path.as_deref())?;
    if let Some(name) = args.name {
        config.username = Some(name);
    }
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }
    if let Some(bind) = args.bind {
        config.segment.bind = bind;
    }
    config.segment.members.extend(args.members);

    let mac = args
        .mac
        .or(config.segment.mac)
        .ok_or("MAC 주소가 필요함 (--mac 또는 설정 파일의 segment.mac)")?;

    info!("Link-Chat starting...");
    info!("MAC: {}", mac);
    info!("Segment: {} -> {:?}", config.segment.bind, config.segment.members);

    let (segment, inbound) = UdpSegment::bind(
        mac,
        config.segment.bind,
        config.segment.members.clone(),
        config.inbound_queue,
    )
    .await?;

    let (node, mut events) = Node::start(config, segment, inbound)?;
    let sender = Arc::clone(node.sender());

    let result = match args.command {
        Command::Listen => {
            listen(&mut events, node.peers()).await;
            Ok(())
        }
        Command::Text { dest, message } => sender.send_text(dest, &message),
        Command::File { dest, path } => {
            run_transfer(sender.spawn_file(dest, path)).await.map(|report| {
                info!(
                    "전송 완료: {} ({} bytes, {} fragments, 미확인 {:?})",
                    report.name, report.size, report.fragments, report.unconfirmed
                );
            })
        }
        Command::Folder { dest, path } => {
            run_transfer(sender.spawn_folder(dest, path)).await.map(|report| {
                info!(
                    "폴더 전송 완료: {} folders, {} files, 미확인 조각 {}, 건너뜀 {:?}",
                    report.folders,
                    report.files.len(),
                    report.unconfirmed_fragments(),
                    report.failed
                );
            })
        }
        Command::Discover => match sender.discover() {
            Ok(()) => {
                let deadline = tokio::time::sleep(DISCOVERY_WAIT);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        event = events.recv() => match event {
                            Some(event) => log_event(&event),
                            None => break,
                        }
                    }
                }
                for peer in node.peers().list() {
                    println!("{}\t{}", peer.mac, peer.username);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    info!("{}", sender.stats().summary());
    node.shutdown().await?;

    if let Err(e) = result {
        error!("실패: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
