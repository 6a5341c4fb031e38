//! FunctionFS descriptor and string blobs.
//!
//! Written once to `ep0` before the bulk endpoints can be opened. Layout
//! follows the kernel's `usb_functionfs_descs_head_v2` and
//! `usb_functionfs_strings_head`.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};

const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 3;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;
const FUNCTIONFS_HAS_FS_DESC: u32 = 1;
const FUNCTIONFS_HAS_HS_DESC: u32 = 2;
const FUNCTIONFS_HAS_SS_DESC: u32 = 4;

const USB_DT_INTERFACE: u8 = 0x04;
const USB_DT_ENDPOINT: u8 = 0x05;
const USB_DT_SS_ENDPOINT_COMP: u8 = 0x30;
const USB_DT_INTERFACE_SIZE: u8 = 9;
const USB_DT_ENDPOINT_SIZE: u8 = 7;
const USB_DT_SS_EP_COMP_SIZE: u8 = 6;
const USB_ENDPOINT_XFER_BULK: u8 = 0x02;
const USB_DIR_IN: u8 = 0x80;
const USB_DIR_OUT: u8 = 0x00;

/// Interface class/subclass/protocol advertised to the host.
pub const FASTBOOT_CLASS: u8 = 0xff;
pub const FASTBOOT_SUBCLASS: u8 = 0x42;
pub const FASTBOOT_PROTOCOL: u8 = 0x03;

pub const MAX_PACKET_SIZE_FS: u16 = 64;
pub const MAX_PACKET_SIZE_HS: u16 = 512;
pub const MAX_PACKET_SIZE_SS: u16 = 1024;

/// Interface string.
pub const INTERFACE_NAME: &str = "FASTBOOT Interface";
const LANG_EN_US: u16 = 0x0409;

/// Bulk endpoint numbers; `ep1` is host-to-device, `ep2` device-to-host.
const EP_OUT: u8 = 1;
const EP_IN: u8 = 2;

fn write_interface(buf: &mut Vec<u8>) -> io::Result<()> {
    buf.write_u8(USB_DT_INTERFACE_SIZE)?;
    buf.write_u8(USB_DT_INTERFACE)?;
    buf.write_u8(0)?; // bInterfaceNumber
    buf.write_u8(0)?; // bAlternateSetting
    buf.write_u8(2)?; // bNumEndpoints
    buf.write_u8(FASTBOOT_CLASS)?;
    buf.write_u8(FASTBOOT_SUBCLASS)?;
    buf.write_u8(FASTBOOT_PROTOCOL)?;
    buf.write_u8(1)?; // iInterface
    Ok(())
}

fn write_bulk_endpoint(buf: &mut Vec<u8>, address: u8, max_packet: u16) -> io::Result<()> {
    buf.write_u8(USB_DT_ENDPOINT_SIZE)?;
    buf.write_u8(USB_DT_ENDPOINT)?;
    buf.write_u8(address)?;
    buf.write_u8(USB_ENDPOINT_XFER_BULK)?;
    buf.write_u16::<LittleEndian>(max_packet)?;
    buf.write_u8(0)?; // bInterval
    Ok(())
}

fn write_ss_companion(buf: &mut Vec<u8>) -> io::Result<()> {
    buf.write_u8(USB_DT_SS_EP_COMP_SIZE)?;
    buf.write_u8(USB_DT_SS_ENDPOINT_COMP)?;
    buf.write_u8(0)?; // bMaxBurst
    buf.write_u8(0)?; // bmAttributes
    buf.write_u16::<LittleEndian>(0)?; // wBytesPerInterval
    Ok(())
}

/// Build the descriptor blob (full, high and super speed).
pub fn descriptor_blob() -> io::Result<Vec<u8>> {
    let mut body = Vec::new();

    // Full speed: interface + 2 endpoints
    write_interface(&mut body)?;
    write_bulk_endpoint(&mut body, USB_DIR_OUT | EP_OUT, MAX_PACKET_SIZE_FS)?;
    write_bulk_endpoint(&mut body, USB_DIR_IN | EP_IN, MAX_PACKET_SIZE_FS)?;

    // High speed
    write_interface(&mut body)?;
    write_bulk_endpoint(&mut body, USB_DIR_OUT | EP_OUT, MAX_PACKET_SIZE_HS)?;
    write_bulk_endpoint(&mut body, USB_DIR_IN | EP_IN, MAX_PACKET_SIZE_HS)?;

    // Super speed: each endpoint carries a companion descriptor
    write_interface(&mut body)?;
    write_bulk_endpoint(&mut body, USB_DIR_OUT | EP_OUT, MAX_PACKET_SIZE_SS)?;
    write_ss_companion(&mut body)?;
    write_bulk_endpoint(&mut body, USB_DIR_IN | EP_IN, MAX_PACKET_SIZE_SS)?;
    write_ss_companion(&mut body)?;

    let header_len = 6 * 4;
    let mut blob = Vec::with_capacity(header_len + body.len());
    blob.write_u32::<LittleEndian>(FUNCTIONFS_DESCRIPTORS_MAGIC_V2)?;
    blob.write_u32::<LittleEndian>((header_len + body.len()) as u32)?;
    blob.write_u32::<LittleEndian>(
        FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC | FUNCTIONFS_HAS_SS_DESC,
    )?;
    blob.write_u32::<LittleEndian>(3)?; // fs_count
    blob.write_u32::<LittleEndian>(3)?; // hs_count
    blob.write_u32::<LittleEndian>(5)?; // ss_count
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Build the strings blob (one language, one string).
pub fn strings_blob() -> io::Result<Vec<u8>> {
    let len = 16 + 2 + INTERFACE_NAME.len() + 1;
    let mut blob = Vec::with_capacity(len);
    blob.write_u32::<LittleEndian>(FUNCTIONFS_STRINGS_MAGIC)?;
    blob.write_u32::<LittleEndian>(len as u32)?;
    blob.write_u32::<LittleEndian>(1)?; // str_count
    blob.write_u32::<LittleEndian>(1)?; // lang_count
    blob.write_u16::<LittleEndian>(LANG_EN_US)?;
    blob.extend_from_slice(INTERFACE_NAME.as_bytes());
    blob.push(0);
    Ok(blob)
}
