use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikitree::catalog::MarkdownCatalog;
use wikitree::classify::display_title;
use wikitree::groups;
use wikitree::hierarchy::TreeNode;
use wikitree::store::JsonConfigStore;
use wikitree::toggles;
use wikitree::{Color, Icon, OrganizationConfig, Workspace};

type Ws = Workspace<MarkdownCatalog, JsonConfigStore>;

#[derive(Debug, Parser)]
#[command(
    name = "wikitree",
    about = "Organize the Markdown files of a directory into a wiki tree",
    version
)]
struct Cli {
    /// Working directory holding the Markdown files.
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the organized tree.
    Tree(TreeArgs),

    /// Drop one file onto another file or a group id.
    Move { active: String, target: String },

    Pin { path: String },
    Unpin { path: String },
    Favorite { path: String },
    Unfavorite { path: String },
    Hide { path: String },
    Unhide { path: String },

    /// Set or clear (no name) a file's highlight color.
    Color { path: String, name: Option<Color> },

    /// Set or clear (no name) a file's icon.
    Icon { path: String, name: Option<Icon> },

    /// Set or clear (no text) a display-title override.
    Title { path: String, text: Option<String> },

    /// Move a nested file back to the top level.
    Unnest { path: String },

    /// Take a file out of its group.
    Ungroup { path: String },

    /// Manage named groups.
    #[command(subcommand)]
    Group(GroupCommand),

    /// Forget organization data of files that no longer exist.
    Prune,
}

#[derive(Debug, Args)]
struct TreeArgs {
    /// Emit JSON instead of an indented listing.
    #[arg(long)]
    json: bool,
    /// Also list hidden files.
    #[arg(long)]
    hidden: bool,
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    Create {
        name: String,
        #[arg(long)]
        icon: Option<Icon>,
        #[arg(long)]
        color: Option<Color>,
    },
    Rename { id: String, name: String },
    Color { id: String, name: Option<Color> },
    Icon { id: String, name: Option<Icon> },
    /// Delete a group; its files become ungrouped.
    Delete { id: String },
    /// Move group `active` into the slot of group `target`.
    Move { active: String, target: String },
    Expand { id: String },
    Collapse { id: String },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("WIKITREE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut ws = Workspace::open(cli.dir.clone(), MarkdownCatalog, JsonConfigStore::default())
        .with_context(|| format!("opening {:?}", cli.dir))?;

    match cli.command {
        Commands::Tree(args) => handle_tree(&ws, args),
        Commands::Move { active, target } => handle_move(&mut ws, &active, &target),
        Commands::Pin { path } => edit(&mut ws, &path, toggles::pin),
        Commands::Unpin { path } => edit(&mut ws, &path, toggles::unpin),
        Commands::Favorite { path } => edit(&mut ws, &path, toggles::favorite),
        Commands::Unfavorite { path } => edit(&mut ws, &path, toggles::unfavorite),
        Commands::Hide { path } => edit(&mut ws, &path, toggles::hide),
        Commands::Unhide { path } => edit(&mut ws, &path, toggles::unhide),
        Commands::Color { path, name } => {
            let path = resolve_path(&ws, &path)?;
            save(&mut ws, |c| toggles::set_color(c, &path, name))
        }
        Commands::Icon { path, name } => {
            let path = resolve_path(&ws, &path)?;
            save(&mut ws, |c| toggles::set_icon(c, &path, name))
        }
        Commands::Title { path, text } => {
            let path = resolve_path(&ws, &path)?;
            save(&mut ws, |c| toggles::set_custom_title(c, &path, text.as_deref()))
        }
        Commands::Unnest { path } => {
            let path = resolve_path(&ws, &path)?;
            save(&mut ws, |c| wikitree::moves::unnest(&path, c).apply(c))
        }
        Commands::Ungroup { path } => {
            let path = resolve_path(&ws, &path)?;
            save(&mut ws, |c| wikitree::moves::ungroup(&path, c).apply(c))
        }
        Commands::Group(cmd) => handle_group(&mut ws, cmd),
        Commands::Prune => {
            let dropped = ws.prune().context("saving pruned config")?;
            println!("Pruned {dropped} stale entries");
            Ok(())
        }
    }
}

/// Accept catalog paths as given, relative to `--dir`, or relative to the shell.
fn resolve_path(ws: &Ws, input: &str) -> Result<String> {
    let known = |path: &str| ws.catalog().iter().any(|f| f.path == path);
    if known(input) {
        return Ok(input.to_string());
    }
    for candidate in [ws.dir().join(input), PathBuf::from(input)] {
        if let Ok(canonical) = fs::canonicalize(&candidate) {
            let canonical = canonical.to_string_lossy().into_owned();
            if known(&canonical) {
                return Ok(canonical);
            }
        }
    }
    anyhow::bail!("{input:?} is not a Markdown file in {:?}", ws.dir())
}

/// Drop targets may also be group ids.
fn resolve_target(ws: &Ws, input: &str) -> Result<String> {
    if ws.config().group(input).is_some() {
        return Ok(input.to_string());
    }
    resolve_path(ws, input)
}

fn save(ws: &mut Ws, f: impl FnOnce(&OrganizationConfig) -> OrganizationConfig) -> Result<()> {
    ws.update(f).context("saving organization config")
}

fn edit(ws: &mut Ws, input: &str, op: fn(&OrganizationConfig, &str) -> OrganizationConfig) -> Result<()> {
    let path = resolve_path(ws, input)?;
    save(ws, |c| op(c, &path))
}

fn handle_move(ws: &mut Ws, active: &str, target: &str) -> Result<()> {
    let active = resolve_path(ws, active)?;
    let target = resolve_target(ws, target)?;
    match ws.drop_on(&active, &target).context("saving move")? {
        Some(intent) => println!("{}", serde_json::to_string(&intent)?),
        None => eprintln!("Nothing to do."),
    }
    Ok(())
}

fn require_group(ws: &Ws, id: &str) -> Result<()> {
    if ws.config().group(id).is_none() {
        anyhow::bail!("no group with id {id:?}");
    }
    Ok(())
}

fn handle_group(ws: &mut Ws, cmd: GroupCommand) -> Result<()> {
    match cmd {
        GroupCommand::Create { name, icon, color } => {
            let group = ws.create_group(&name, icon, color).context("saving new group")?;
            println!("{}", group.id);
            Ok(())
        }
        GroupCommand::Rename { id, name } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::rename_group(c, &id, &name))
        }
        GroupCommand::Color { id, name } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::recolor_group(c, &id, name))
        }
        GroupCommand::Icon { id, name } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::reicon_group(c, &id, name))
        }
        GroupCommand::Delete { id } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::delete_group(c, &id))
        }
        GroupCommand::Move { active, target } => {
            require_group(ws, &active)?;
            require_group(ws, &target)?;
            save(ws, |c| groups::move_group(c, &active, &target))
        }
        GroupCommand::Expand { id } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::set_group_expanded(c, &id, true))
        }
        GroupCommand::Collapse { id } => {
            require_group(ws, &id)?;
            save(ws, |c| groups::set_group_expanded(c, &id, false))
        }
    }
}

fn handle_tree(ws: &Ws, args: TreeArgs) -> Result<()> {
    let tree = ws.tree();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }

    let config = ws.config();
    let mut first = true;
    print_section(&mut first, "Pinned", &tree.pinned, config);
    for (group, nodes) in &tree.groups {
        let marker = if config.expanded_groups.contains(&group.id) { "" } else { " (collapsed)" };
        let title = format!("{} [{}]{marker}", group.name, group.id);
        print_section(&mut first, &title, nodes, config);
    }
    print_section(&mut first, "Files", &tree.ungrouped, config);

    if args.hidden {
        let hidden = ws.classify().hidden;
        if !hidden.is_empty() {
            println!();
            println!("== Hidden ==");
            for file in hidden {
                println!("{}  ({})", display_title(file, config), file.path);
            }
        }
    }
    Ok(())
}

fn print_section(first: &mut bool, title: &str, nodes: &[TreeNode<'_>], config: &OrganizationConfig) {
    if nodes.is_empty() {
        return;
    }
    if !*first {
        println!();
    }
    *first = false;
    println!("== {title} ==");
    for node in nodes {
        print_node(node, config, 0);
    }
}

fn print_node(node: &TreeNode<'_>, config: &OrganizationConfig, depth: usize) {
    let file = node.file;
    let mut marks = String::new();
    if config.is_favorite(&file.path) {
        marks.push_str(" *");
    }
    if let Some(color) = config.overlay(&file.path).and_then(|o| o.color) {
        marks.push_str(&format!(" [{color}]"));
    }
    println!(
        "{}{}{}  ({})",
        "  ".repeat(depth),
        display_title(file, config),
        marks,
        file.path
    );
    for child in &node.children {
        print_node(child, config, depth + 1);
    }
}
