// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! DWARF extraction. Go names structure types with their full package
//! path (`net/http.Request`), so a wanted field resolves to a
//! `DW_TAG_structure_type` of that name, then the `DW_TAG_member` of the
//! field, then its `DW_AT_data_member_location`.

use std::{borrow::Cow, collections::HashMap};

use gimli::{AttributeValue, EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection};

use crate::{errors::GenError, manifest::WantedField};

type Reader<'a> = EndianSlice<'a, RunTimeEndian>;

/// Offsets for every wanted field, `None` when the struct or member is
/// absent from the binary's debug info.
pub fn extract_offsets(
    path_hint: &str,
    binary: &[u8],
    wanted: &[WantedField],
) -> Result<HashMap<WantedField, Option<u64>>, GenError> {
    let file = object::File::parse(binary)
        .map_err(|e| GenError::BinaryUnreadable(path_hint.to_string(), e.to_string()))?;
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<Cow<'_, [u8]>, gimli::Error> {
        match file.section_by_name(id.name()) {
            Some(section) => Ok(section
                .uncompressed_data()
                .unwrap_or(Cow::Borrowed(&[][..]))),
            None => Ok(Cow::Borrowed(&[][..])),
        }
    };
    let dwarf_sections = gimli::Dwarf::load(load_section)?;
    let dwarf = dwarf_sections.borrow(|section| EndianSlice::new(section, endian));

    let mut results: HashMap<WantedField, Option<u64>> =
        wanted.iter().map(|w| (w.clone(), None)).collect();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut tree = unit.entries_tree(None)?;
        walk(&dwarf, &unit, tree.root()?, wanted, &mut results)?;
    }
    Ok(results)
}

fn walk(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    unit: &gimli::Unit<Reader<'_>>,
    node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'_>>,
    wanted: &[WantedField],
    results: &mut HashMap<WantedField, Option<u64>>,
) -> Result<(), GenError> {
    let is_wanted_struct = node.entry().tag() == gimli::DW_TAG_structure_type
        && match entry_name(dwarf, unit, node.entry())? {
            Some(name) => wanted.iter().any(|w| w.struct_key() == name),
            None => false,
        };

    if is_wanted_struct {
        let struct_name = entry_name(dwarf, unit, node.entry())?.unwrap_or_default();
        let mut members = node.children();
        while let Some(member) = members.next()? {
            if member.entry().tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(member_name) = entry_name(dwarf, unit, member.entry())? else {
                continue;
            };
            for field in wanted {
                if field.struct_key() == struct_name && field.field == member_name {
                    results.insert(field.clone(), member_location(member.entry()));
                }
            }
        }
        return Ok(());
    }

    let mut children = node.children();
    while let Some(child) = children.next()? {
        walk(dwarf, unit, child, wanted, results)?;
    }
    Ok(())
}

fn entry_name(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    unit: &gimli::Unit<Reader<'_>>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'_>>,
) -> Result<Option<String>, GenError> {
    let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf.attr_string(unit, attr)?;
    Ok(Some(name.to_string_lossy().into_owned()))
}

fn member_location(
    entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'_>>,
) -> Option<u64> {
    match entry.attr_value(gimli::DW_AT_data_member_location).ok()?? {
        AttributeValue::Udata(offset) => Some(offset),
        AttributeValue::Sdata(offset) => u64::try_from(offset).ok(),
        AttributeValue::Data1(offset) => Some(offset.into()),
        AttributeValue::Data2(offset) => Some(offset.into()),
        AttributeValue::Data4(offset) => Some(offset.into()),
        AttributeValue::Data8(offset) => Some(offset),
        _ => None,
    }
}
