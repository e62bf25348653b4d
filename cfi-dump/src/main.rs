use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dwarfwind::{
    arch::X86_64,
    complaint::Complaints,
    dwarf::{
        exec::{CfaRule, CfiProgram, RegisterRule},
        parse::{CfiOptions, CfiTable, FrameSection},
        quirks::producer_quirks,
    },
    reader::Endian,
};
use object::{Object, ObjectSection};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prints the call frame information of an ELF file.
#[derive(Parser)]
struct Args {
    path: PathBuf,
    /// Also print the rules in effect at this address.
    #[arg(long, value_parser = parse_address)]
    pc: Option<u64>,
    #[arg(long, conflicts_with = "debug_frame_only")]
    eh_frame_only: bool,
    #[arg(long)]
    debug_frame_only: bool,
    /// Where the file is loaded, relative to its link address.
    #[arg(long, value_parser = parse_address, default_value = "0")]
    text_offset: u64,
}

fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Contents and address of the section called `name`.
fn section<'d>(file: &object::File<'d>, name: &str) -> Result<Option<(&'d [u8], u64)>> {
    match file.section_by_name(name) {
        Some(section) => Ok(Some((section.data()?, section.address()))),
        None => Ok(None),
    }
}

fn main() -> Result<()> {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::WARN.into())
            .from_env()?,
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let args = Args::parse();
    let data = std::fs::read(&args.path)
        .with_context(|| format!("reading {}", args.path.display()))?;
    let file = object::File::parse(&*data).context("parsing object file")?;

    let eh_frame = if args.debug_frame_only {
        None
    } else {
        section(&file, ".eh_frame")?.map(|(data, addr)| FrameSection::eh_frame(data, addr))
    };
    let debug_frame = if args.eh_frame_only {
        None
    } else {
        section(&file, ".debug_frame")?.map(|(data, addr)| FrameSection::debug_frame(data, addr))
    };
    if eh_frame.is_none() && debug_frame.is_none() {
        bail!("{} has no call frame information", args.path.display());
    }

    let address_size = if file.is_64() { 8 } else { 4 };
    let options = CfiOptions {
        endian: if file.is_little_endian() {
            Endian::Little
        } else {
            Endian::Big
        },
        address_size,
        ptr_size: address_size,
        text_offset: args.text_offset,
        text_base: section(&file, ".text")?.map_or(0, |(_, addr)| addr),
        data_base: section(&file, ".got")?.map_or(0, |(_, addr)| addr),
        ..CfiOptions::default()
    };

    let complaints = Complaints::default();
    let table = CfiTable::build(eh_frame, debug_frame, &options, &complaints);

    for fde in table.fdes() {
        let cie = table.cie(fde);
        let start = fde.initial_location.wrapping_add(args.text_offset);
        println!(
            "{:#018x}..{:#018x} {} fde@{:#x} cie@{:#x} augmentation={:?}",
            start,
            start.wrapping_add(fde.address_range),
            fde.section.kind,
            fde.offset,
            cie.offset,
            cie.augmentation,
        );
    }

    let Some(pc) = args.pc else {
        return Ok(());
    };
    let fde = table
        .find_fde(pc)
        .with_context(|| format!("no FDE covers {pc:#x}"))?;
    let cie = table.cie(fde);
    let program = CfiProgram {
        cie,
        fde,
        text_offset: table.text_offset(),
    };
    let state = program
        .rules_at(pc, &X86_64, &complaints, producer_quirks(None, cie))
        .with_context(|| format!("running CFI program at {pc:#x}"))?;

    println!();
    println!("rules at {pc:#x} (row at {:#x}):", state.pc);
    match state.regs.cfa {
        CfaRule::Unset => println!("  cfa: unset"),
        CfaRule::RegisterOffset => println!(
            "  cfa: r{}{:+}",
            state.regs.cfa_register, state.regs.cfa_offset
        ),
        CfaRule::Expression(expr) => println!("  cfa: {expr:?}"),
    }
    for (column, rule) in state.regs.iter() {
        if rule != RegisterRule::Unspecified {
            let ra = if column == state.retaddr_column { " (ra)" } else { "" };
            println!("  r{column}{ra}: {rule:?}");
        }
    }

    Ok(())
}
