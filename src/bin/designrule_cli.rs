//! DesignRule CLI
//!
//! Commands: templates, validate, compile, parse, project
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use designrule_core::{
    import_json,
    logging::{self, Profile},
    parse, Compiler, EngineConfig, FieldBindings, FieldCatalog, Projector, ProvenanceTable,
    RenderPipeline, RenderRequest, RuleSet, RuleStore, Size, Validator, Viewport,
};

#[derive(Parser)]
#[command(name = "designrule-cli")]
#[command(about = "DesignRule CLI - Design Rule Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON log lines instead of human-readable output
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List rule sets in a directory
    Templates {
        #[arg(short, long, default_value = "templates")]
        dir: PathBuf,
    },

    /// Validate a rule set file
    Validate {
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Compile a rule set into a render manifest
    Compile {
        #[arg(short, long)]
        rules: PathBuf,

        /// Asset path on the renderer
        #[arg(short, long)]
        asset: String,

        /// Canvas as WIDTHxHEIGHT; defaults to the rule set's own
        #[arg(long)]
        canvas: Option<Size>,

        /// Field bindings as JSON
        #[arg(long)]
        fields: Option<String>,
    },

    /// Compile, then tag each fragment with its layer
    Parse {
        #[arg(short, long)]
        rules: PathBuf,

        #[arg(short, long)]
        asset: String,

        #[arg(long)]
        canvas: Option<Size>,
    },

    /// Overlay boxes for each visible layer
    Project {
        #[arg(short, long)]
        rules: PathBuf,

        /// Size of the asset the renderer returned
        #[arg(long)]
        rendered: Size,

        #[arg(long, default_value_t = 1.0)]
        scale: f64,
    },
}

fn emit<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(message: &str) -> ExitCode {
    println!("{}", serde_json::json!({ "success": false, "error": message }));
    ExitCode::FAILURE
}

fn load_rules(path: &Path) -> Result<RuleSet, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    import_json(&content).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(if cli.json_logs { Profile::Production } else { Profile::Development });

    let config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(c) => c,
            Err(e) => return fail(&e.to_string()),
        },
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Templates { dir } => {
            let store = match RuleStore::load_from_dir(&dir) {
                Ok(s) => s,
                Err(e) => return fail(&format!("Failed to load rule sets: {}", e)),
            };
            let listing: Vec<_> = store
                .ids()
                .filter_map(|id| store.get(id))
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "canvas": r.canvas().to_string(),
                        "layers": r.layers.len(),
                    })
                })
                .collect();
            emit(&listing)
        }

        Commands::Validate { rules } => {
            let content = match fs::read_to_string(&rules) {
                Ok(c) => c,
                Err(e) => return fail(&e.to_string()),
            };
            match import_json(&content) {
                Ok(rule_set) => emit(&Validator::new().validate(&rule_set)),
                Err(e) => {
                    println!("{}", serde_json::json!({ "valid": false, "error": e.to_string() }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Compile { rules, asset, canvas, fields } => {
            let rule_set = match load_rules(&rules) {
                Ok(r) => r,
                Err(e) => return fail(&e),
            };
            let parsed = fields.as_deref().map(serde_json::from_str::<FieldBindings>);
            let fields = match parsed.transpose() {
                Ok(f) => f,
                Err(e) => return fail(&format!("Invalid fields: {}", e)),
            };

            let template_id = rule_set.id.clone();
            let mut store = RuleStore::new();
            if let Err(e) = store.register_parent(rule_set) {
                return fail(&e.to_string());
            }
            let pipeline = RenderPipeline::new(store, &config);
            let request = RenderRequest { template_id, asset_id: asset, canvas, fields };
            match pipeline.render(&request) {
                Ok(manifest) => emit(&serde_json::json!({ "success": true, "manifest": manifest })),
                Err(e) => {
                    println!("{}", serde_json::json!({ "success": false, "error": e.to_string() }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Parse { rules, asset, canvas } => {
            let rule_set = match load_rules(&rules) {
                Ok(r) => r,
                Err(e) => return fail(&e),
            };
            let fields = FieldBindings::seed(&FieldCatalog::build(&rule_set));
            let canvas = canvas.unwrap_or(rule_set.canvas());
            let compiler = Compiler::new(config.compiler.clone());
            let plan = compiler.plan(&rule_set, &fields, canvas, &asset);
            emit(&parse(&plan.transformation(), &ProvenanceTable::build(&plan)))
        }

        Commands::Project { rules, rendered, scale } => {
            let rule_set = match load_rules(&rules) {
                Ok(r) => r,
                Err(e) => return fail(&e),
            };
            let fields = FieldBindings::seed(&FieldCatalog::build(&rule_set));
            let projector = Projector::new(config.geometry.clone(), config.compiler.clone());
            let viewport = Viewport { scale, ..Viewport::default() };
            emit(&projector.project_all(&rule_set, &fields, rule_set.canvas(), rendered, viewport))
        }
    }
}
