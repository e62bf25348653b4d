use alloc::{vec, vec::Vec};

use super::{LocList, LocListFormat};
use crate::{error::Error, reader::Endian, testing::FakeDebugInfo};

fn loclist(data: &[u8], format: LocListFormat) -> LocList<'_> {
    LocList {
        data,
        format,
        base_address: 0,
        address_size: 8,
        text_offset: 0,
        endian: Endian::Little,
        sign_extend_vma: false,
    }
}

fn corrupted() -> Error {
    Error::Corrupt("dwarf2_find_location_expression: Corrupted DWARF expression.".into())
}

#[test]
fn loclists_base_and_offset_pair() {
    #[rustfmt::skip]
    let data = [
        // DW_LLE_base_address (0x1000)
        0x06, 0x00, 0x10, 0, 0, 0, 0, 0, 0,
        // DW_LLE_offset_pair (0x10, 0x20): DW_OP_reg5 DW_OP_piece 8
        0x04, 0x10, 0x20, 3, 0x55, 0x93, 0x08,
        // DW_LLE_end_of_list
        0x00,
    ];
    let list = loclist(&data, LocListFormat::Loclists);
    let debug = FakeDebugInfo::default();

    assert_eq!(
        list.find_expression(0x1015, &debug).unwrap(),
        Some(&[0x55, 0x93, 0x08][..])
    );
    assert_eq!(list.find_expression(0x1010, &debug).unwrap(), Some(&[0x55, 0x93, 0x08][..]));
    assert_eq!(list.find_expression(0x1020, &debug).unwrap(), None);
    assert_eq!(list.find_expression(0x2000, &debug).unwrap(), None);
}

#[test]
fn legacy_pairs() {
    let mut data = Vec::new();
    // base address selection: 0x2000
    data.extend_from_slice(&u64::MAX.to_le_bytes());
    data.extend_from_slice(&0x2000u64.to_le_bytes());
    // [base, base+8): DW_OP_reg0
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend_from_slice(&8u64.to_le_bytes());
    data.extend_from_slice(&[1, 0, 0x50]);
    // [base+8, base+0x10): DW_OP_reg1
    data.extend_from_slice(&8u64.to_le_bytes());
    data.extend_from_slice(&0x10u64.to_le_bytes());
    data.extend_from_slice(&[1, 0, 0x51]);
    data.extend_from_slice(&[0; 16]);

    let mut list = loclist(&data, LocListFormat::Loc);
    list.text_offset = 0x100;
    let debug = FakeDebugInfo::default();
    assert_eq!(list.find_expression(0x2104, &debug).unwrap(), Some(&[0x50][..]));
    assert_eq!(list.find_expression(0x210f, &debug).unwrap(), Some(&[0x51][..]));
    assert_eq!(list.find_expression(0x2004, &debug).unwrap(), None);
    assert_eq!(list.find_expression(0x2110, &debug).unwrap(), None);
}

#[test]
fn legacy_signed_addresses() {
    #[rustfmt::skip]
    let data = [
        // base address selection with 32-bit addresses: 0x400
        0xff, 0xff, 0xff, 0xff, 0x00, 0x04, 0x00, 0x00,
        // [base+4, base+8): DW_OP_lit1
        0x04, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 1, 0, 0x31,
        0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let mut list = loclist(&data, LocListFormat::Loc);
    list.address_size = 4;
    list.sign_extend_vma = true;
    let debug = FakeDebugInfo::default();
    assert_eq!(list.find_expression(0x406, &debug).unwrap(), Some(&[0x31][..]));
}

#[test]
fn zero_width_entries_at_function_entry() {
    #[rustfmt::skip]
    let data = [
        // DW_LLE_base_address (0x1000)
        0x06, 0x00, 0x10, 0, 0, 0, 0, 0, 0,
        // DW_LLE_offset_pair (0, 0): DW_OP_entry_value(DW_OP_reg5) DW_OP_stack_value
        0x04, 0x00, 0x00, 4, 0xa3, 1, 0x55, 0x9f,
        // DW_LLE_offset_pair (0, 0x40): DW_OP_reg3
        0x04, 0x00, 0x40, 1, 0x53,
        0x00,
    ];
    let list = loclist(&data, LocListFormat::Loclists);

    let debug = FakeDebugInfo {
        functions: vec![(0x1000, 0x1100)],
        ..FakeDebugInfo::default()
    };
    assert_eq!(
        list.find_expression(0x1000, &debug).unwrap(),
        Some(&[0xa3, 1, 0x55, 0x9f][..])
    );

    // padding that happens to start at the pc of a function that starts
    // elsewhere
    let debug = FakeDebugInfo {
        functions: vec![(0x0ff0, 0x1100)],
        ..FakeDebugInfo::default()
    };
    assert_eq!(list.find_expression(0x1000, &debug).unwrap(), Some(&[0x53][..]));
    assert_eq!(
        list.find_expression(0x1000, &FakeDebugInfo::default()).unwrap(),
        Some(&[0x53][..])
    );
}

#[test]
fn split_dwarf_indices() {
    #[rustfmt::skip]
    let data = [
        // DW_LLE_GNU_start_end_entry [0] [1]: DW_OP_reg0
        0x02, 0, 1, 1, 0, 0x50,
        // DW_LLE_GNU_start_length_entry [2] 0x10: DW_OP_reg1
        0x03, 2, 0x10, 0, 0, 0, 1, 0, 0x51,
        // DW_LLE_GNU_end_of_list_entry
        0x00,
    ];
    let mut list = loclist(&data, LocListFormat::LocDwo);
    list.text_offset = 0x10;
    // the base is never added to split dwarf addresses
    list.base_address = 0x5000;
    let debug = FakeDebugInfo {
        addresses: vec![0x1000, 0x1100, 0x2000],
        ..FakeDebugInfo::default()
    };
    assert_eq!(list.find_expression(0x1010, &debug).unwrap(), Some(&[0x50][..]));
    assert_eq!(list.find_expression(0x2015, &debug).unwrap(), Some(&[0x51][..]));
    assert_eq!(list.find_expression(0x2020, &debug).unwrap(), None);
    assert_eq!(list.find_expression(0x3000, &debug).unwrap(), None);

    // a base address selection changes nothing for index-based ranges
    let data = [0x01, 1, 0x02, 0, 1, 1, 0, 0x50, 0x00];
    let list = loclist(&data, LocListFormat::LocDwo);
    assert_eq!(list.find_expression(0x1004, &debug).unwrap(), Some(&[0x50][..]));
}

#[test]
fn loclists_absolute_ranges() {
    #[rustfmt::skip]
    let data = [
        // DW_LLE_base_address (0x5000)
        0x06, 0x00, 0x50, 0, 0, 0, 0, 0, 0,
        // DW_LLE_startx_endx [0] [1]: DW_OP_reg0
        0x02, 0, 1, 1, 0x50,
        // DW_LLE_start_end (0x2000, 0x2010): DW_OP_reg1
        0x07, 0x00, 0x20, 0, 0, 0, 0, 0, 0, 0x10, 0x20, 0, 0, 0, 0, 0, 0, 1, 0x51,
        0x00,
    ];
    let mut list = loclist(&data, LocListFormat::Loclists);
    list.text_offset = 0x10;
    let debug = FakeDebugInfo {
        addresses: vec![0x1000, 0x1100],
        ..FakeDebugInfo::default()
    };
    assert_eq!(list.find_expression(0x1010, &debug).unwrap(), Some(&[0x50][..]));
    assert_eq!(list.find_expression(0x110f, &debug).unwrap(), Some(&[0x50][..]));
    assert_eq!(list.find_expression(0x2015, &debug).unwrap(), Some(&[0x51][..]));
    assert_eq!(list.find_expression(0x2020, &debug).unwrap(), None);
    assert_eq!(list.find_expression(0x6010, &debug).unwrap(), None);
}

#[test]
fn corrupt_lists() {
    let debug = FakeDebugInfo::default();
    let cases: [(&[u8], LocListFormat); 5] = [
        // DW_LLE_default_location
        (&[0x05, 0x01, 0x50], LocListFormat::Loclists),
        // offset pair cut short
        (&[0x04, 0x00], LocListFormat::Loclists),
        // expression longer than the list
        (&[0x04, 0x00, 0x40, 5, 0x50], LocListFormat::Loclists),
        // no end of list
        (&[0x04, 0x00, 0x40, 1, 0x50], LocListFormat::Loclists),
        // unknown GNU kind
        (&[0x04, 0x00], LocListFormat::LocDwo),
    ];
    for (data, format) in cases {
        let list = loclist(data, format);
        assert_eq!(
            list.find_expression(0x1000, &debug).unwrap_err(),
            corrupted(),
            "{data:x?}"
        );
    }

    // legacy lists need whole address pairs
    let list = loclist(&[0x10, 0, 0, 0], LocListFormat::Loc);
    assert_eq!(list.find_expression(0x10, &debug).unwrap_err(), corrupted());
}
