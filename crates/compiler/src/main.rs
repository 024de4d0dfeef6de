//! Ed.Py compiler CLI
//!
//! Two front-ends share the binary: `compile` runs the full pipeline from
//! source to WAV, `assemble` runs the token assembler over a pre-generated
//! listing. Diagnostics go to the console, a JSON object, or the
//! machine-readable test format.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use edc::{DiagSink, Kind, Level, SinkKind};
use edc_asm::AudioOutput;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(name = "edc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ed.Py compiler and token assembler for the Edison robot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputSink {
    Json,
    Console,
    Both,
    Test,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputLevel {
    Error,
    Warn,
    Top,
    Info,
    Verbose,
    Debug,
}

impl OutputLevel {
    fn to_level(self) -> Level {
        match self {
            OutputLevel::Error => Level::Error,
            OutputLevel::Warn => Level::Warn,
            OutputLevel::Top => Level::Top,
            OutputLevel::Info => Level::Info,
            OutputLevel::Verbose => Level::Verbose,
            OutputLevel::Debug => Level::Debug,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SpecialTest {
    Pass,
    Fail,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an Ed.Py source file to a loadable WAV / binary image
    Compile {
        /// Path to a language file (diagnostic format overrides)
        lang: PathBuf,

        /// Path to the source to be compiled
        src: PathBuf,

        /// Check syntax only, don't generate the WAV file
        #[arg(short = 'c')]
        check_only: bool,

        /// Disable listing optimisations (and make downloads slower)
        #[arg(short = 's')]
        no_listing_opts: bool,

        /// Save the assembler listing
        #[arg(short = 'a', value_name = "LISTING")]
        listing: Option<PathBuf>,

        /// Save the final binary (with preamble)
        #[arg(short = 'b', value_name = "BIN")]
        binary: Option<PathBuf>,

        /// Don't output the WAV file
        #[arg(short = 'w')]
        no_wav: bool,

        /// Output location
        #[arg(short = 'o', value_enum, default_value = "json")]
        output: OutputSink,

        /// Output level; everything at this level and above is emitted
        #[arg(short = 'l', value_enum, default_value = "warn")]
        level: OutputLevel,

        /// Debug dump mask: 1 parse, 2 optimise, 4 compile, 8 listing,
        /// 16 binary
        #[arg(short = 'd', value_name = "DUMPMASK", default_value = "0")]
        dump: u32,

        /// Special test mode, instead of normal processing
        #[arg(short = 'x', value_enum)]
        special: Option<SpecialTest>,

        /// Report internal error context chains
        #[arg(short = 'r')]
        reraise: bool,
    },

    /// Assemble a pre-generated token listing
    Assemble {
        /// Path to the listing to be assembled
        src: Option<PathBuf>,

        /// Save the binary image
        #[arg(short = 'b', value_name = "BIN")]
        binary: Option<PathBuf>,

        /// Add the 2-byte preamble to the binary written
        #[arg(short = 'p')]
        preamble: bool,

        /// Output a WAV of the assembled image
        #[arg(short = 'w', value_name = "WAV")]
        wav: Option<PathBuf>,

        /// Output level
        #[arg(short = 'l', value_enum, default_value = "error")]
        level: OutputLevel,

        /// Output parsing information
        #[arg(short = 'd')]
        debug: bool,

        /// Print the device type, location and register tables
        #[arg(short = 'r')]
        reg_help: bool,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            lang,
            src,
            check_only,
            no_listing_opts,
            listing,
            binary,
            no_wav,
            output,
            level,
            dump,
            special,
            reraise,
        } => run_compile(CompileArgs {
            lang,
            src,
            check_only,
            optimise: !no_listing_opts,
            listing,
            binary,
            no_wav,
            output,
            level,
            dump,
            special,
            reraise,
        }),
        Commands::Assemble {
            src,
            binary,
            preamble,
            wav,
            level,
            debug,
            reg_help,
        } => run_assemble(src, binary, preamble, wav, level, debug, reg_help),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "edc", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
    }
}

struct CompileArgs {
    lang: PathBuf,
    src: PathBuf,
    check_only: bool,
    optimise: bool,
    listing: Option<PathBuf>,
    binary: Option<PathBuf>,
    no_wav: bool,
    output: OutputSink,
    level: OutputLevel,
    dump: u32,
    special: Option<SpecialTest>,
    reraise: bool,
}

fn run_compile(args: CompileArgs) -> ExitCode {
    let mut diag = DiagSink::new();
    diag.set_sink(match args.output {
        OutputSink::Json => SinkKind::Json,
        OutputSink::Console => SinkKind::Console,
        OutputSink::Both => SinkKind::Both,
        OutputSink::Test => SinkKind::Test,
    });
    diag.set_max_level(args.level.to_level());
    diag.set_dump_mask(args.dump);
    diag.set_reraise(args.reraise);

    // the language file supplies per-kind format overrides
    match std::fs::read_to_string(&args.lang) {
        Ok(body) => {
            if let Err(e) = diag.load_language(&body) {
                diag.debug_raw(&e);
            }
        }
        Err(_) => {
            diag.error(Kind::FileOpenError, &[&args.lang.display()]);
            diag.flush();
            return ExitCode::FAILURE;
        }
    }

    let src_dir = args
        .src
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    // special test modes replace normal processing entirely
    match args.special {
        Some(SpecialTest::Pass) => {
            return match AudioOutput::generated(&src_dir) {
                Ok(out) => {
                    diag.set_wav_filename(&out.path().display().to_string());
                    diag.force_json_error(false);
                    if out.write_debug_wav().is_err() {
                        diag.flush();
                        return ExitCode::FAILURE;
                    }
                    diag.flush();
                    ExitCode::SUCCESS
                }
                Err(_) => {
                    diag.flush();
                    ExitCode::FAILURE
                }
            };
        }
        Some(SpecialTest::Fail) => {
            diag.error(Kind::SpecialFail, &[]);
            diag.flush();
            return ExitCode::FAILURE;
        }
        None => {}
    }

    let result = edc::compile_file(&args.src, args.optimise, &mut diag);

    let rtc = match result {
        Ok(artifacts) => {
            if let Some(path) = &args.listing {
                if write_lines(path, &artifacts.listing).is_err() {
                    diag.error(Kind::FileOpenError, &[&path.display()]);
                }
            }

            if !args.check_only && !args.no_wav {
                let download = artifacts.download_bytes();
                match AudioOutput::generated(&src_dir) {
                    Ok(out) => {
                        diag.set_wav_filename(&out.path().display().to_string());
                        if out.write_wav(&download).is_err() {
                            diag.error(Kind::FileOpenError, &[&"wav output"]);
                        }
                    }
                    Err(_) => {
                        diag.error(Kind::FileOpenError, &[&"wav output"]);
                    }
                }

                if let Some(path) = &args.binary {
                    if std::fs::write(path, &download).is_err() {
                        diag.error(Kind::FileOpenError, &[&path.display()]);
                    }
                }
            }
            if diag.was_error_raised() {
                1
            } else {
                0
            }
        }
        Err(stage) => {
            if diag.reraise() {
                eprintln!("stage failed: {:?}", stage);
                eprintln!("collected output: {}", diag.output_as_string());
            }
            1
        }
    };

    diag.flush();
    if rtc == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

fn run_assemble(
    src: Option<PathBuf>,
    binary: Option<PathBuf>,
    preamble: bool,
    wav: Option<PathBuf>,
    level: OutputLevel,
    debug: bool,
    reg_help: bool,
) -> ExitCode {
    let mut diag = DiagSink::new();
    diag.set_sink(SinkKind::Console);
    diag.set_max_level(level.to_level());

    if reg_help {
        println!("Device type, locations and register help");
        println!("----------------------------------------");
        edc_asm::Assembler::new().lexer.dump_reg_help();
        return ExitCode::SUCCESS;
    }

    let src = match src {
        Some(s) => s,
        None => {
            eprintln!("Error -- missing source path");
            return ExitCode::FAILURE;
        }
    };

    let assembled = match edc_asm::assemble_file(&src, debug, &mut diag) {
        Ok(a) => a,
        Err(_) => {
            eprintln!("ERROR - No output produced");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "Assembly completed of {} file: {} -- created {} bytes of tokens and header",
        match assembled.download_type {
            edc::DownloadType::Program => "program",
            edc::DownloadType::Firmware => "firmware",
        },
        src.display(),
        assembled.bytes.len()
    );

    if let Some(path) = binary {
        let bytes = if preamble {
            assembled.download_bytes()
        } else {
            assembled.bytes.clone()
        };
        println!("Writing {} bytes to file: {}", bytes.len(), path.display());
        if std::fs::write(&path, bytes).is_err() {
            eprintln!("ERROR - could not write {}", path.display());
            return ExitCode::FAILURE;
        }
    }

    if let Some(path) = wav {
        match AudioOutput::named(&path) {
            Ok(out) => {
                if out.write_wav(&assembled.download_bytes()).is_err() {
                    eprintln!("ERROR - could not write {}", path.display());
                    return ExitCode::FAILURE;
                }
            }
            Err(_) => {
                eprintln!("ERROR - could not create {}", path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
