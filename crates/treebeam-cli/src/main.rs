//! treebeam command line: build network images, dump them, decode score
//! matrices.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use treebeam_core::{
    LanguageModel, Lexicon, MatrixScorer, SearchOptions, TableLm,
};
use treebeam_network::{
    CacheArchive, LookaheadStructure, StateGraph, TreeBuilder, dump, load_or_build_tree,
    lookahead_config_checksum,
};
use treebeam_search::Decoder;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Lexicon(#[from] treebeam_core::LexiconError),

    #[error(transparent)]
    Scorer(#[from] treebeam_core::ScorerError),

    #[error(transparent)]
    Network(#[from] treebeam_network::NetworkError),

    #[error(transparent)]
    Search(#[from] treebeam_search::SearchError),
}

#[derive(Parser)]
#[command(name = "treebeam", about = "Sequence-to-sequence tree search decoder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the label tree (and lookahead) and write the cache images.
    Build {
        /// Lexicon JSON.
        #[arg(long)]
        lexicon: PathBuf,
        /// Scorer spec JSON (provides the emission table).
        #[arg(long)]
        scorer: PathBuf,
        /// Search options JSON; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Tied-state graph JSON for the hmm label unit.
        #[arg(long)]
        state_graph: Option<PathBuf>,
        /// Cache directory for the images.
        #[arg(long)]
        cache: PathBuf,
    },
    /// Pretty-print the tree built from the given inputs.
    Dump {
        #[arg(long)]
        lexicon: PathBuf,
        #[arg(long)]
        scorer: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        state_graph: Option<PathBuf>,
        /// Also dump the lookahead structure.
        #[arg(long)]
        lookahead: bool,
    },
    /// Decode one segment from a score-matrix scorer spec.
    Decode {
        #[arg(long)]
        lexicon: PathBuf,
        /// Scorer spec JSON with the per-step score matrix.
        #[arg(long)]
        scorer: PathBuf,
        /// Language model table JSON.
        #[arg(long)]
        lm: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        state_graph: Option<PathBuf>,
        /// Write the word lattice to this JSON file.
        #[arg(long)]
        lattice: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_to_string(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_owned(),
        source,
    })
}

fn load_lexicon(path: &Path) -> Result<Lexicon, CliError> {
    let file = File::open(path).map_err(|source| CliError::Read {
        path: path.to_owned(),
        source,
    })?;
    Ok(Lexicon::from_json_reader(BufReader::new(file))?)
}

fn load_options(path: Option<&PathBuf>) -> Result<SearchOptions, CliError> {
    match path {
        None => Ok(SearchOptions::default()),
        Some(path) => SearchOptions::from_json_str(&read_to_string(path)?).map_err(|source| {
            CliError::Parse {
                path: path.clone(),
                source,
            }
        }),
    }
}

fn load_scorer(path: &Path) -> Result<MatrixScorer, CliError> {
    Ok(MatrixScorer::from_json_str(&read_to_string(path)?)?)
}

fn load_state_graph(path: Option<&PathBuf>) -> Result<Option<StateGraph>, CliError> {
    match path {
        None => Ok(None),
        Some(path) => StateGraph::from_json_str(&read_to_string(path)?)
            .map(Some)
            .map_err(|source| CliError::Parse {
                path: path.clone(),
                source,
            }),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Build {
            lexicon,
            scorer,
            config,
            state_graph,
            cache,
        } => {
            let lexicon = load_lexicon(&lexicon)?;
            let scorer = load_scorer(&scorer)?;
            let mut options = load_options(config.as_ref())?;
            options.cache_dir = Some(cache.clone());
            let graph = load_state_graph(state_graph.as_ref())?;

            let archive = CacheArchive::new(&cache);
            let tree =
                load_or_build_tree(Some(&archive), &lexicon, &scorer, &options, graph.as_ref())?;
            println!(
                "label tree: {} nodes, {} exits",
                tree.num_nodes(),
                tree.all_exits().len()
            );

            let structure = LookaheadStructure::build(&tree)?;
            structure.write_image(
                &archive,
                lookahead_config_checksum(&tree, options.lm_lookahead_history_limit),
            )?;
            println!("lm lookahead: {} entries", structure.n_entries());
            Ok(())
        }

        Command::Dump {
            lexicon,
            scorer,
            config,
            state_graph,
            lookahead,
        } => {
            let lexicon = load_lexicon(&lexicon)?;
            let scorer = load_scorer(&scorer)?;
            let options = load_options(config.as_ref())?;
            let graph = load_state_graph(state_graph.as_ref())?;

            let builder = TreeBuilder::new(&lexicon, &scorer, &options);
            let tree = match &graph {
                Some(graph) => builder.build_hmm(graph)?,
                None => builder.build()?,
            };
            println!("{}", dump::dump_tree(&tree, &lexicon));
            if lookahead {
                let structure = LookaheadStructure::build(&tree)?;
                println!("{}", dump::dump_lookahead(&structure, &tree));
            }
            Ok(())
        }

        Command::Decode {
            lexicon,
            scorer,
            lm,
            config,
            state_graph,
            lattice,
        } => {
            let mut lexicon = load_lexicon(&lexicon)?;
            let scorer = load_scorer(&scorer)?;
            let options = load_options(config.as_ref())?;
            let graph = load_state_graph(state_graph.as_ref())?;

            let lm: Option<Arc<dyn LanguageModel>> = match lm {
                None => None,
                Some(path) => {
                    let table = TableLm::from_json_str(
                        &read_to_string(&path)?,
                        lexicon.tokens_mut(),
                    )
                    .map_err(|source| CliError::Parse { path, source })?;
                    Some(Arc::new(table))
                }
            };

            let mut decoder = Decoder::new(
                Arc::new(lexicon),
                Box::new(scorer),
                lm,
                &options,
                graph.as_ref(),
            )?;
            let result = decoder.decode_segment(lattice.is_some())?;

            println!("{}", result.text());
            println!(
                "score: acoustic={:.4} lm={:.4} labels={} words={} steps={}",
                result.score.acoustic,
                result.score.lm,
                result.n_labels,
                result.n_words,
                result.steps
            );
            if let Some(path) = lattice {
                let out = result.lattice.as_ref().expect("lattice requested");
                let file = File::create(&path).map_err(|source| CliError::Read {
                    path: path.clone(),
                    source,
                })?;
                serde_json::to_writer_pretty(file, out)
                    .map_err(|source| CliError::Parse { path, source })?;
                println!("lattice written");
            }
            Ok(())
        }
    }
}
