//! Command line interface.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::api::{self, ImageInterface, OpOutcome, PkgOpOptions};
use crate::context::OpContext;
use crate::errors::{ExitStatus, LinkedError};
use crate::image::{ImageConfig, Publisher};
use crate::linked::dispatch::Selection;
use crate::linked::name::LinkedImageName;
use crate::linked::ops::LinkedOpOptions;
use crate::linked::request::{self, ChildRequest};
use crate::output;
use crate::plan::Stage;
use crate::planner::PkgOp;
use crate::varcet::{FACET_PREFIX, VARIANT_PREFIX};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use imgpkg_client::{Parsable, PARSABLE_VERSION};
use std::collections::BTreeMap;
use std::io::Write;

/// Parse a `key=value` argument.
fn parse_kv(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected key=value: {s}"))?;
    if k.is_empty() {
        anyhow::bail!("empty key in {s}");
    }
    Ok((k.to_string(), v.to_string()))
}

fn with_prefix(prefix: &str, k: &str) -> String {
    if k.starts_with(prefix) {
        k.to_string()
    } else {
        format!("{prefix}{k}")
    }
}

#[derive(Debug, Parser)]
#[clap(name = "imgpkg", rename_all = "kebab-case", version)]
/// Manage package images and the links between them
pub struct Opt {
    /// Operate on the image rooted at this directory
    #[clap(short = 'R', long, global = true, value_name = "DIR")]
    image_dir: Option<Utf8PathBuf>,

    /// Print machine readable JSON output
    #[clap(
        long,
        global = true,
        value_name = "VERSION",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "0"
    )]
    parsable: Option<u32>,

    #[clap(subcommand)]
    cmd: Cmd,
}

/// Which children a linked operation applies to.  Without any of these
/// the operation applies to the image itself.  There is no `-I` here:
/// skipping every child is the same as not selecting any.
#[derive(Debug, Default, clap::Args)]
pub struct ChildSelectOpts {
    /// Operate on all children
    #[clap(short = 'a', long = "all", conflicts_with = "child")]
    all: bool,

    /// Operate on the named child
    #[clap(short = 'l', long = "child", value_name = "NAME")]
    child: Vec<LinkedImageName>,

    /// Skip the named child (with -a); omit -a and -l to operate on this
    /// image instead of its children
    #[clap(short = 'i', long = "ignore-child", value_name = "NAME")]
    ignore: Vec<LinkedImageName>,

    /// Ignore names of children which are not attached
    #[clap(long)]
    ignore_unknown: bool,
}

impl ChildSelectOpts {
    fn selection(&self) -> Result<Selection> {
        Selection::from_args(self.all, &self.child, &self.ignore)
    }
}

#[derive(Debug, Default, clap::Args)]
pub struct LinkedFlags {
    /// Use the cached parent state rather than reading the parent image
    #[clap(long)]
    no_parent_sync: bool,

    /// Fail if any packages would need to change
    #[clap(long)]
    no_pkg_updates: bool,

    /// Only update linked image metadata; don't change packages
    #[clap(long)]
    linked_md_only: bool,

    /// Show what would be done without changing anything
    #[clap(short = 'n', long)]
    noexecute: bool,

    /// Perform only one stage of the operation
    #[clap(long, value_enum, default_value = "default")]
    stage: Stage,
}

impl LinkedFlags {
    fn options(&self) -> LinkedOpOptions {
        LinkedOpOptions {
            md_only: self.linked_md_only,
            no_pkg_updates: self.no_pkg_updates,
            noexecute: self.noexecute,
            stage: self.stage,
            no_parent_sync: self.no_parent_sync,
            ..Default::default()
        }
    }
}

/// Options for package operations.
#[derive(Debug, Default, clap::Args)]
pub struct PkgFlags {
    /// Run the operation in all children too
    #[clap(short = 'r', long)]
    recurse: bool,

    /// With -r, only recurse into the named child
    #[clap(short = 'z', value_name = "NAME", requires = "recurse")]
    recurse_include: Vec<LinkedImageName>,

    /// With -r, don't recurse into the named child
    #[clap(short = 'Z', value_name = "NAME", requires = "recurse")]
    recurse_exclude: Vec<LinkedImageName>,

    /// Don't sync the named child
    #[clap(short = 'i', long = "ignore-child", value_name = "NAME")]
    ignore: Vec<LinkedImageName>,

    /// Don't sync any children
    #[clap(short = 'I', long = "ignore-all-children", conflicts_with = "ignore")]
    ignore_all: bool,

    /// Use the cached parent state rather than reading the parent image
    #[clap(long)]
    no_parent_sync: bool,

    /// Show what would be done without changing anything
    #[clap(short = 'n', long)]
    noexecute: bool,

    /// Perform only one stage of the operation
    #[clap(long, value_enum, default_value = "default")]
    stage: Stage,
}

impl PkgFlags {
    fn options(&self) -> Result<PkgOpOptions> {
        let recurse = if self.recurse && !self.recurse_include.is_empty() {
            Selection::from_args(false, &self.recurse_include, &self.recurse_exclude)?
        } else {
            Selection::from_args(self.recurse, &[], &self.recurse_exclude)?
        };
        let implicit = if self.ignore_all {
            Selection::None
        } else if self.ignore.is_empty() {
            Selection::All
        } else {
            Selection::from_args(true, &[], &self.ignore)?
        };
        Ok(PkgOpOptions {
            stage: self.stage,
            noexecute: self.noexecute,
            recurse,
            implicit,
            no_parent_sync: self.no_parent_sync,
            ignore_unknown: false,
        })
    }
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Cmd {
    /// Create a new image
    ImageCreate {
        root: Utf8PathBuf,
        /// Configure a publisher (repeatable; first is highest ranked)
        #[clap(long = "publisher", short = 'p', value_name = "NAME")]
        publishers: Vec<String>,
        /// Set a variant
        #[clap(long = "variant", value_name = "NAME=VALUE", value_parser = parse_kv)]
        variants: Vec<(String, String)>,
        /// Set a facet
        #[clap(long = "facet", value_name = "NAME=BOOL", value_parser = parse_kv)]
        facets: Vec<(String, String)>,
    },
    /// Install packages
    Install {
        #[clap(required = true)]
        pkgs: Vec<String>,
        #[clap(flatten)]
        flags: PkgFlags,
    },
    /// Update packages (all of them if none are named)
    Update {
        pkgs: Vec<String>,
        #[clap(flatten)]
        flags: PkgFlags,
    },
    /// Remove packages
    Uninstall {
        #[clap(required = true)]
        pkgs: Vec<String>,
        #[clap(flatten)]
        flags: PkgFlags,
    },
    /// Change facets; a value of `None` restores the default
    ChangeFacet {
        #[clap(required = true, value_name = "NAME=BOOL", value_parser = parse_kv)]
        facets: Vec<(String, String)>,
        #[clap(flatten)]
        flags: PkgFlags,
    },
    /// Change variants
    ChangeVariant {
        #[clap(required = true, value_name = "NAME=VALUE", value_parser = parse_kv)]
        variants: Vec<(String, String)>,
        #[clap(flatten)]
        flags: PkgFlags,
    },
    /// List effective facets
    Facet,
    /// List effective variants
    Variant,
    /// Attach a child to this image (-c), or this image to a parent (-p)
    AttachLinked {
        /// Attach the image at PATH as a child
        #[clap(short = 'c', conflicts_with = "parent", required_unless_present = "parent")]
        child: bool,
        /// Attach this image to the parent at PATH
        #[clap(short = 'p')]
        parent: bool,
        name: LinkedImageName,
        path: Utf8PathBuf,
        /// Set a linked image property
        #[clap(long = "prop-linked", value_name = "NAME=VALUE", value_parser = parse_kv)]
        props: Vec<(String, String)>,
        /// Replace an existing link
        #[clap(long)]
        allow_relink: bool,
        /// Override restrictions of the image kind
        #[clap(short = 'f', long)]
        force: bool,
        #[clap(flatten)]
        flags: LinkedFlags,
    },
    /// Detach this image from its parent, or children from this image
    DetachLinked {
        #[clap(flatten)]
        select: ChildSelectOpts,
        /// Override restrictions of the image kind; forget unreachable children
        #[clap(short = 'f', long)]
        force: bool,
        #[clap(flatten)]
        flags: LinkedFlags,
    },
    /// Check whether images are in sync with their parent
    AuditLinked {
        #[clap(flatten)]
        select: ChildSelectOpts,
        /// Use the cached parent state rather than reading the parent image
        #[clap(long)]
        no_parent_sync: bool,
    },
    /// Bring images in sync with their parent
    SyncLinked {
        #[clap(flatten)]
        select: ChildSelectOpts,
        #[clap(flatten)]
        flags: LinkedFlags,
    },
    /// List linked images
    ListLinked,
    /// Show linked image properties
    PropertyLinked {
        /// Show properties of the named child
        #[clap(short = 'l', long = "child", value_name = "NAME")]
        child: Option<LinkedImageName>,
        keys: Vec<String>,
    },
    /// Change linked image properties
    SetPropertyLinked {
        /// Change properties of the named child
        #[clap(short = 'l', long = "child", value_name = "NAME")]
        child: Option<LinkedImageName>,
        #[clap(required = true, value_name = "NAME=VALUE", value_parser = parse_kv)]
        props: Vec<(String, String)>,
    },
    /// Check publisher configuration against the parent
    PubcheckLinked {
        #[clap(flatten)]
        select: ChildSelectOpts,
        /// Use the cached parent state rather than reading the parent image
        #[clap(long)]
        no_parent_sync: bool,
    },
    /// Carry out a request from a parent image, read from stdin
    #[clap(hide = true)]
    ChildOp,
}

/// What a command produced.
#[derive(Debug)]
enum CmdOutput {
    Outcome(OpOutcome),
    Parsable(Parsable),
}

fn open(ctx: &OpContext, root: &Utf8Path) -> Result<ImageInterface> {
    ImageInterface::open(ctx, root)
}

fn facet_changes(kvs: &[(String, String)]) -> Result<BTreeMap<String, Option<bool>>> {
    let mut r = BTreeMap::new();
    for (k, v) in kvs {
        let v = match v.as_str() {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            "None" => None,
            o => {
                return Err(LinkedError::BadOption(format!("invalid facet value {k}={o}")).into())
            }
        };
        r.insert(with_prefix(FACET_PREFIX, k), v);
    }
    Ok(r)
}

/// Run a linked operation on the image itself or on selected children.
fn self_or_children(
    api: &mut ImageInterface,
    select: &ChildSelectOpts,
    on_self: impl FnOnce(&mut ImageInterface) -> Result<OpOutcome>,
    on_children: impl FnOnce(&mut ImageInterface, &Selection) -> Result<OpOutcome>,
) -> Result<OpOutcome> {
    let sel = select.selection()?;
    if sel.is_none() {
        if !select.ignore.is_empty() {
            return Err(LinkedError::BadOption("-i requires -a".into()).into());
        }
        on_self(api)
    } else {
        on_children(api, &sel)
    }
}

impl Cmd {
    fn run(self, ctx: &OpContext, root: &Utf8Path) -> Result<CmdOutput> {
        let r = match self {
            Cmd::ImageCreate {
                root,
                publishers,
                variants,
                facets,
            } => {
                let mut cfg = ImageConfig {
                    publishers: publishers.into_iter().map(Publisher::new).collect(),
                    ..Default::default()
                };
                for (k, v) in variants {
                    cfg.variants.insert(with_prefix(VARIANT_PREFIX, &k), v);
                }
                for (k, v) in facet_changes(&facets)? {
                    if let Some(v) = v {
                        cfg.facets.insert(k, v);
                    }
                }
                api::image_create(&root, cfg)?;
                OpOutcome::new(ExitStatus::Ok)
            }
            Cmd::Install { pkgs, flags } => {
                open(ctx, root)?.pkg_op(PkgOp::Install { pkgs }, &flags.options()?)?
            }
            Cmd::Update { pkgs, flags } => {
                open(ctx, root)?.pkg_op(PkgOp::Update { pkgs }, &flags.options()?)?
            }
            Cmd::Uninstall { pkgs, flags } => {
                open(ctx, root)?.pkg_op(PkgOp::Uninstall { pkgs }, &flags.options()?)?
            }
            Cmd::ChangeFacet { facets, flags } => {
                let op = PkgOp::ChangeVarcets {
                    facets: facet_changes(&facets)?,
                    variants: BTreeMap::new(),
                };
                open(ctx, root)?.pkg_op(op, &flags.options()?)?
            }
            Cmd::ChangeVariant { variants, flags } => {
                let op = PkgOp::ChangeVarcets {
                    facets: BTreeMap::new(),
                    variants: variants
                        .into_iter()
                        .map(|(k, v)| (with_prefix(VARIANT_PREFIX, &k), v))
                        .collect(),
                };
                open(ctx, root)?.pkg_op(op, &flags.options()?)?
            }
            Cmd::Facet => {
                let api = open(ctx, root)?;
                return Ok(CmdOutput::Parsable(Parsable {
                    version: PARSABLE_VERSION,
                    facets: output::varcet_rows(&api.facets()?),
                    ..Default::default()
                }));
            }
            Cmd::Variant => {
                let api = open(ctx, root)?;
                return Ok(CmdOutput::Parsable(Parsable {
                    version: PARSABLE_VERSION,
                    variants: output::varcet_rows(&api.variants()?),
                    ..Default::default()
                }));
            }
            Cmd::AttachLinked {
                child,
                parent: _,
                name,
                path,
                props,
                allow_relink,
                force,
                flags,
            } => {
                let opts = LinkedOpOptions {
                    allow_relink,
                    force,
                    ..flags.options()
                };
                let mut api = open(ctx, root)?;
                if child {
                    api.attach_child(&name, &path, &props, &opts)?
                } else {
                    api.attach_parent(&name, &path, &props, &opts)?
                }
            }
            Cmd::DetachLinked {
                select,
                force,
                flags,
            } => {
                let opts = LinkedOpOptions {
                    force,
                    ignore_unknown: select.ignore_unknown,
                    ..flags.options()
                };
                let mut api = open(ctx, root)?;
                self_or_children(
                    &mut api,
                    &select,
                    |api| api.detach_self(&opts),
                    |api, sel| api.detach_children(sel, &opts),
                )?
            }
            Cmd::AuditLinked {
                select,
                no_parent_sync,
            } => {
                let opts = LinkedOpOptions {
                    no_parent_sync,
                    ignore_unknown: select.ignore_unknown,
                    ..Default::default()
                };
                let mut api = open(ctx, root)?;
                self_or_children(
                    &mut api,
                    &select,
                    |api| api.audit_self(&opts),
                    |api, sel| api.audit_children(sel, &opts),
                )?
            }
            Cmd::SyncLinked { select, flags } => {
                let opts = LinkedOpOptions {
                    ignore_unknown: select.ignore_unknown,
                    ..flags.options()
                };
                let mut api = open(ctx, root)?;
                self_or_children(
                    &mut api,
                    &select,
                    |api| api.sync_self(&opts),
                    |api, sel| api.sync_children(sel, &opts),
                )?
            }
            Cmd::ListLinked => {
                let api = open(ctx, root)?;
                return Ok(CmdOutput::Parsable(output::list_to_parsable(api.list())));
            }
            Cmd::PropertyLinked { child, keys } => {
                let api = open(ctx, root)?;
                let props = api.properties(child.as_ref(), &keys)?;
                return Ok(CmdOutput::Parsable(output::properties_to_parsable(props)));
            }
            Cmd::SetPropertyLinked { child, props } => {
                open(ctx, root)?.set_properties(child.as_ref(), &props)?
            }
            Cmd::PubcheckLinked {
                select,
                no_parent_sync,
            } => {
                let opts = LinkedOpOptions {
                    no_parent_sync,
                    ignore_unknown: select.ignore_unknown,
                    ..Default::default()
                };
                let mut api = open(ctx, root)?;
                self_or_children(
                    &mut api,
                    &select,
                    |api| api.pubcheck(&opts),
                    |api, sel| api.pubcheck_children(sel, &opts),
                )?
            }
            Cmd::ChildOp => anyhow::bail!("child-op is only run by a parent image"),
        };
        Ok(CmdOutput::Outcome(r))
    }
}

/// Read one request from stdin, carry it out and print the response.
/// The exit code is always 0 once a response has been written; the
/// outcome is in the response.
fn child_op(ctx: &OpContext, root: &Utf8Path) -> Result<i32> {
    let stdin = std::io::stdin();
    let req: ChildRequest = serde_json::from_reader(std::io::BufReader::new(stdin.lock()))
        .context("Parsing child request")?;
    let resp = request::handle(ctx, root, &req);
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    serde_json::to_writer(&mut stdout, &resp)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(0)
}

fn print_plain(out: &mut impl Write, cmd: &CmdOutput) -> Result<()> {
    match cmd {
        CmdOutput::Outcome(o) => output::print_outcome(out, o),
        CmdOutput::Parsable(p) => {
            if !p.linked.is_empty() {
                output::print_list(out, &p.linked)?;
            }
            if !p.properties.is_empty() {
                output::print_properties(out, &p.properties)?;
            }
            output::print_varcets(out, &p.facets)?;
            output::print_varcets(out, &p.variants)
        }
    }
}

impl Opt {
    fn root(&self, ctx: &OpContext) -> Utf8PathBuf {
        self.image_dir
            .clone()
            .or_else(|| ctx.config.image_root.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(ctx.live_root()))
    }

    pub fn parsable(&self) -> bool {
        self.parsable.is_some()
    }

    /// Run the command, printing its results.  Returns the exit code.
    pub fn run(self, ctx: &mut OpContext) -> Result<i32> {
        if let Some(v) = self.parsable {
            if v != PARSABLE_VERSION {
                return Err(LinkedError::BadOption(format!("unsupported parsable version {v}")).into());
            }
        }
        let root = self.root(ctx);
        if matches!(self.cmd, Cmd::ChildOp) {
            return child_op(ctx, &root);
        }
        ctx.progress = !self.parsable();
        let parsable = self.parsable();
        let r = self.cmd.run(ctx, &root)?;
        let code = match &r {
            CmdOutput::Outcome(o) => o.status.code(),
            CmdOutput::Parsable(_) => ExitStatus::Ok.code(),
        };
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        if parsable {
            let p = match r {
                CmdOutput::Outcome(o) => output::outcome_to_parsable(&o),
                CmdOutput::Parsable(p) => Parsable { exit: code, ..p },
            };
            output::print_parsable(&mut stdout, &p)?;
        } else {
            print_plain(&mut stdout, &r)?;
        }
        Ok(code)
    }
}

/// Parse arguments; `--help` and usage errors exit the process.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Opt {
    Opt::parse_from(args)
}
