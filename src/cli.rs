use clap::{Arg, Command};

pub fn build_cli() -> Command {
    Command::new("flowtap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Passive TCP/TLS traffic tap with HTTP, AMQP and Kafka dissection")
        .arg(
            Arg::new("interface")
                .short('i')
                .long("interface")
                .value_name("INTERFACE")
                .help("Network interface to tap (auto-selected if omitted)")
                .required(false),
        )
        .arg(
            Arg::new("read-file")
                .short('r')
                .long("read-file")
                .value_name("FILE")
                .help("Replay a pcap file instead of capturing live")
                .conflicts_with("interface")
                .required(false),
        )
        .arg(
            Arg::new("bpf-filter")
                .short('f')
                .long("bpf-filter")
                .value_name("FILTER")
                .help("BPF filter applied to the capture, e.g. \"tcp port 80\"")
                .required(false),
        )
        .arg(
            Arg::new("ports")
                .long("ports")
                .value_name("PORTS")
                .help("Comma separated server ports to tap (default: every protocol port)")
                .required(false),
        )
        .arg(
            Arg::new("authorities")
                .long("authorities")
                .value_name("TARGETS")
                .help("Comma separated ip or ip:port targets; switches to host mode")
                .required(false),
        )
        .arg(
            Arg::new("any-direction")
                .long("any-direction")
                .help("Also tap connections initiated by the targets")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("Tap TLS plaintext through user-space hooks")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tls-bpf-object")
                .long("tls-bpf-object")
                .value_name("FILE")
                .help("Compiled TLS hook object")
                .required(false),
        )
        .arg(
            Arg::new("tls-pid")
                .long("tls-pid")
                .value_name("PID[:NAMESPACE]")
                .help("Attribute TLS traffic of a process to a namespace (repeatable)")
                .action(clap::ArgAction::Append)
                .required(false),
        )
        .arg(
            Arg::new("procfs")
                .long("procfs")
                .value_name("DIR")
                .help("procfs mount used for socket lookups")
                .required(false),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: ~/.config/flowtap/config)")
                .required(false),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level: error, warn, info, debug or trace")
                .default_value("info")
                .required(false),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Directory for log files (logging is off without it)")
                .required(false),
        )
        .arg(
            Arg::new("summaries")
                .long("summaries")
                .help("Print the summary of every entry next to it")
                .action(clap::ArgAction::SetTrue),
        )
}
