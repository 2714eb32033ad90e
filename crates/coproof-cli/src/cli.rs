use std::path::PathBuf;

use clap::{value_parser, ArgAction, Args, Parser, Subcommand};
use coproof_domain::{StatementId, StatementKind};

pub const COPROOF_BEFORE_HELP: &str = concat!(
    "coproof ",
    env!("CARGO_PKG_VERSION"),
    " – collaborative proof repository engine\n\n",
    "\x1b[1;36mAuthoring\x1b[0m\n",
    "  scaffold         Render a statement file locally (nothing is pushed).\n",
    "  parse            Print the metadata a statement file declares.\n",
    "  submit           Push a new statement to its proposal branch.\n\n",
    "\x1b[1;36mReview\x1b[0m\n",
    "  verify           Compile a proposal merged with the default branch.\n",
    "  merge            Verify, merge into the default branch and reindex.\n\n",
    "\x1b[1;36mRepository\x1b[0m\n",
    "  mirror           Create, refresh or evict a project's mirror.\n",
    "  sync / reindex   Rebuild the statement index from the default branch.\n",
    "  show / graph     Read a statement's files or list the indexed graph.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    disable_help_subcommand = true,
    before_help = COPROOF_BEFORE_HELP
)]
pub struct CoproofCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-v info, -vv debug, -vvv trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        long,
        value_parser = value_parser!(PathBuf),
        help = "Storage root for mirrors, worktrees, locks and the index (overrides COPROOF_STORAGE_PATH)",
        global = true
    )]
    pub storage: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(
        about = "Render a statement source from its metadata without touching any repository.",
        override_usage = "coproof scaffold --kind KIND --name NAME --signature SIG [--id ID] [--parent ID] [--dep ID ...]"
    )]
    Scaffold(ScaffoldArgs),
    #[command(
        about = "Parse a statement file and print its id, parent, kind and dependencies.",
        override_usage = "coproof parse <FILE> [--as PATH]"
    )]
    Parse(ParseArgs),
    #[command(subcommand)]
    Mirror(MirrorCommand),
    #[command(about = "Fetch the remote and rebuild the statement index from the default branch.")]
    Sync(RemoteArgs),
    #[command(about = "Rebuild the statement index from the mirror without fetching.")]
    Reindex(ProjectArgs),
    #[command(about = "List the indexed statements of a project.")]
    Graph(ProjectArgs),
    #[command(
        about = "Print a statement's source and companion files at a revision.",
        override_usage = "coproof show --project P --remote URL <ID> [--rev REV]"
    )]
    Show(ShowArgs),
    #[command(
        about = "Validate a new statement against the index and push it to a proposal branch.",
        after_help = "Examples:\n  coproof submit --project demo --remote https://git.example/demo.git \\\n      --author-name Ada --author-email ada@example.com \\\n      --kind lemma --name step_one --signature 'True' --parent <ID>\n"
    )]
    Submit(SubmitArgs),
    #[command(
        about = "Compile a proposal branch as it would look after merging.",
        visible_alias = "validate"
    )]
    Verify(ProposalArgs),
    #[command(about = "Verify a proposal, merge it into the default branch and reindex.")]
    Merge(ProposalArgs),
}

#[derive(Subcommand, Debug)]
pub enum MirrorCommand {
    #[command(about = "Clone the project's mirror if it does not exist yet, then fetch.")]
    Ensure(RemoteArgs),
    #[command(about = "Fetch every branch of an existing mirror.")]
    Fetch(RemoteArgs),
    #[command(about = "Delete the project's mirror from the storage root.")]
    Evict(ProjectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    #[arg(long, value_name = "PROJECT")]
    pub project: String,
}

#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    #[arg(long, value_name = "PROJECT")]
    pub project: String,
    #[arg(long, value_name = "URL", env = "COPROOF_REMOTE_URL")]
    pub remote: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[arg(value_name = "ID")]
    pub statement_id: StatementId,
    #[arg(long = "rev", value_name = "REV", help = "Commit or ref (defaults to the default branch tip)")]
    pub revision: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatementArgs {
    #[arg(long = "id", value_name = "ID", help = "Statement id (a fresh one is generated when omitted)")]
    pub statement_id: Option<String>,
    #[arg(long = "parent", value_name = "ID", help = "Parent statement id, or 'root'")]
    pub parent_statement_id: Option<String>,
    #[arg(long)]
    pub kind: StatementKind,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub signature: String,
    #[arg(long = "proof", value_name = "BODY", help = "Proof body (an open marker is written when omitted)")]
    pub proof_body: Option<String>,
    #[arg(long = "dep", value_name = "ID", action = ArgAction::Append)]
    pub dependencies: Vec<String>,
    #[arg(
        long,
        value_parser = value_parser!(PathBuf),
        value_name = "FILE",
        help = "Companion (natural-language) file to store next to the source"
    )]
    pub companion: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ScaffoldArgs {
    #[command(flatten)]
    pub statement: StatementArgs,
    #[arg(
        long,
        value_parser = value_parser!(PathBuf),
        value_name = "DIR",
        help = "Write the rendered files under DIR instead of printing them"
    )]
    pub write: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ParseArgs {
    #[arg(value_parser = value_parser!(PathBuf), value_name = "FILE")]
    pub file: PathBuf,
    #[arg(
        long = "as",
        value_name = "PATH",
        help = "Repository-relative path to parse the file as (defaults to the file name)"
    )]
    pub rel_path: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[command(flatten)]
    pub statement: StatementArgs,
    #[arg(long, value_name = "NAME", env = "COPROOF_AUTHOR_NAME")]
    pub author_name: String,
    #[arg(long, value_name = "EMAIL", env = "COPROOF_AUTHOR_EMAIL")]
    pub author_email: String,
    #[arg(long, value_name = "BRANCH", help = "Proposal branch (defaults to proposal/<ID>)")]
    pub branch: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProposalArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[arg(long, value_name = "BRANCH")]
    pub branch: String,
    #[arg(value_name = "ID")]
    pub statement_id: StatementId,
}
