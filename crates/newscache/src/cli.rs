//! Exposes the command line application.
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use newscache_service::articles::{ArticleService, GroupState, JsonStore, Request};
use newscache_service::caching;
use newscache_service::config::Config;
use newscache_service::metrics;

use crate::logging;

fn get_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn get_long_crate_version() -> &'static str {
    concat!(
        "version: ",
        env!("CARGO_PKG_VERSION"),
        "\ngit commit: ",
        env!("NEWSCACHE_GIT_VERSION")
    )
}

/// Newscache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Print an article as NNTP response.
    Article(ArticleArgs),

    /// Drop articles from the cache, so they are assembled again on next request.
    Invalidate {
        /// Message-ids of the articles.
        #[arg(required = true, value_name = "MSGID")]
        msgids: Vec<String>,
    },

    /// Clean local caches.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct ArticleArgs {
    /// The message-id of the article, or its number if `--group` is given.
    id: String,

    /// Look up the article by number in this group.
    #[arg(long, short)]
    group: Option<String>,

    /// Only print the headers.
    #[arg(long, conflicts_with_all = ["body", "stat"])]
    head: bool,

    /// Only print the body.
    #[arg(long, conflicts_with = "stat")]
    body: bool,

    /// Only check that the article exists.
    #[arg(long)]
    stat: bool,
}

impl ArticleArgs {
    fn request(&self) -> Request {
        if self.head {
            Request::Head
        } else if self.body {
            Request::Body
        } else if self.stat {
            Request::Stat
        } else {
            Request::Article
        }
    }
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(
    bin_name = "newscache",
    version = get_crate_version(),
    long_version = get_long_crate_version(),
)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("NEWSCACHE_RELEASE").into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        if let Some(tag) = config.metrics.environment_tag.clone() {
            if let Some(name) = sentry.options().environment.as_ref() {
                tags.insert(tag, name.to_string());
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to set up metrics")?;
    }

    match cli.command {
        Command::Article(args) => {
            let stdout = io::stdout();
            article(&config, &args, &mut stdout.lock())?
        }
        Command::Invalidate { msgids } => invalidate(&config, &msgids)?,
        Command::Cleanup { dry_run } => {
            caching::cleanup(&config, dry_run).context("failed to clean up caches")?
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<JsonStore> {
    let path = config
        .article_store
        .as_deref()
        .context("no `article_store` configured")?;
    JsonStore::open(path)
}

fn service(config: &Config, store: JsonStore) -> Result<ArticleService<JsonStore>> {
    ArticleService::from_config(config, Arc::new(store)).context("failed to open article cache")
}

/// Writes the response for one article request to `out`.
///
/// Error responses are written as well, and reported as an error afterwards.
fn article<W: Write>(config: &Config, args: &ArticleArgs, out: &mut W) -> Result<()> {
    let service = service(config, open_store(config)?)?;
    let request = args.request();

    let mut state = GroupState::default();
    let result = match args.group {
        Some(ref group) => {
            let number = args
                .id
                .parse()
                .with_context(|| format!("invalid article number `{}`", args.id))?;
            service
                .select_group(&mut state, group)
                .and_then(|()| service.obtain_by_number(out, request, number, &mut state))
        }
        None => service.obtain_by_msgid(out, request, &args.id, &state),
    };

    if let Err(ref err) = result {
        err.write_response(out)
            .context("failed to write error response")?;
    }
    result.with_context(|| format!("failed to get article `{}`", args.id))
}

fn invalidate(config: &Config, msgids: &[String]) -> Result<()> {
    let store = match config.article_store {
        Some(_) => open_store(config)?,
        None => JsonStore::default(),
    };
    let service = service(config, store)?;

    let mut failed = BTreeMap::new();
    for msgid in msgids {
        match service.invalidate(msgid) {
            Ok(()) => tracing::info!(msgid = msgid.as_str(), "Invalidated article"),
            Err(err) => {
                failed.insert(msgid.as_str(), err);
            }
        }
    }

    if let Some((msgid, err)) = failed.iter().next() {
        anyhow::bail!(
            "failed to invalidate {} article(s), first was `{msgid}`: {err}",
            failed.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use crate::test;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["newscache", "-c", "cfg.yml", "article", "--body", "<a@b>"]);
        assert_eq!(cli.config(), Some(Path::new("cfg.yml")));
        match cli.command {
            Command::Article(args) => assert_eq!(args.request(), Request::Body),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["newscache", "article", "--head", "--stat", "<a@b>"]).is_err());
        assert!(Cli::try_parse_from(["newscache", "invalidate"]).is_err());
    }

    fn config(dir: &Path) -> Config {
        let store = test::write_json(dir, "store.json", &test::article_store());
        Config {
            cache_dir: Some(dir.join("cache")),
            article_store: Some(store),
            ..Default::default()
        }
    }

    fn args(id: &str, group: Option<&str>) -> ArticleArgs {
        ArticleArgs {
            id: id.into(),
            group: group.map(Into::into),
            head: false,
            body: false,
            stat: false,
        }
    }

    #[test]
    fn test_article() {
        test::setup();
        let dir = test::tempdir();
        let config = config(dir.path());

        let mut out = Vec::new();
        let mut stat = args("2", Some("misc.test"));
        stat.stat = true;
        article(&config, &stat, &mut out).unwrap();
        assert_eq!(out, b"223 2 <second@example.com>\r\n");

        let mut out = Vec::new();
        assert!(article(&config, &args("<nope@example.com>", None), &mut out).is_err());
        assert_eq!(out, b"430 no such article\r\n");

        let mut out = Vec::new();
        assert!(article(&config, &args("x", Some("misc.test")), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalidate() {
        test::setup();
        let dir = test::tempdir();
        let config = config(dir.path());

        let mut out = Vec::new();
        article(&config, &args("<first@example.com>", None), &mut out).unwrap();
        let cached = std::fs::read_dir(dir.path().join("cache/articles")).unwrap().count();
        assert_eq!(cached, 1);

        invalidate(&config, &["<first@example.com>".into()]).unwrap();

        let mut after = Vec::new();
        article(&config, &args("<first@example.com>", None), &mut after).unwrap();
        assert_eq!(out, after);
    }
}
