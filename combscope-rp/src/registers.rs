//! Registers of the oscilloscope core in the FPGA are
//! accessed through the system ram (Addr8). It is a 32bit
//! system, so the address format is u32.
//! _ a note here _ : Each register is 32bit. This means for
//! the Addr8 (8 refers to bits) a register occupies 4 bytes,
//! so a new register will be the previous register + 4.
//!
//! All addresses are offsets into the scope register block
//! (mapped at 0x40100000). They are a fixed contract with
//! the FPGA bitstream.

//========== Scope control ==============
//
//=======================================

pub const CONFIG              : u32 = 0x00000; // [0] arm trigger [1] reset write state machine
pub const TRIGGER_SOURCE      : u32 = 0x00004; // [3:0] trigger source, cleared by the fpga once the trigger fired
pub const THRESHOLD_A         : u32 = 0x00008; // [13:0] channel a trigger threshold
pub const THRESHOLD_B         : u32 = 0x0000c; // [13:0] channel b trigger threshold
pub const LEGACY_POST_TRIGGER : u32 = 0x00010; // [31:0] samples the legacy recorder takes after the trigger
pub const DECIMATION          : u32 = 0x00014; // [16:0] decimation factor
pub const HYSTERESIS_A        : u32 = 0x00020; // [13:0] channel a trigger hysteresis
pub const HYSTERESIS_B        : u32 = 0x00024; // [13:0] channel b trigger hysteresis
pub const AVERAGING           : u32 = 0x00028; // [0] average samples while decimating
pub const TRIGGER_DEADTIME    : u32 = 0x00090; // [31:0] trigger deadtime in samples

/// CONFIG bits
pub const CONFIG_ARM          : u32 = 0x1;
pub const CONFIG_RESET        : u32 = 0x2;

//========== Input filters ==============
//
// 4 consecutive words per channel:
// aa, bb (equalization) kk, pp (shaping)
//=======================================

pub const FILTER_A            : u32 = 0x00030;
pub const FILTER_B            : u32 = 0x00040;

pub const FILTER_AA           : u32 = 0x0;
pub const FILTER_BB           : u32 = 0x4;
pub const FILTER_KK           : u32 = 0x8;
pub const FILTER_PP           : u32 = 0xc;

/// Equalization coefficients (aa, bb) for the high voltage (1:20) input range
pub const EQ_HV_COEFFS        : (u32, u32) = (0x4c5f, 0x2f38b);
/// Equalization coefficients (aa, bb) for the low voltage (1:1) input range
pub const EQ_LV_COEFFS        : (u32, u32) = (0x7d93, 0x437c7);
pub const EQ_OFF_COEFFS       : (u32, u32) = (0x0, 0x0);
/// Shaping filter coefficients (kk, pp)
pub const SHAPING_ON_COEFFS   : (u32, u32) = (0xd9999a, 0x2666);
pub const SHAPING_OFF_COEFFS  : (u32, u32) = (0xffffff, 0x0);

/// Any small value > 0 makes the trigger source register
/// clear right after the trigger fired
pub const LEGACY_POST_TRIGGER_SAMPLES : u32 = 10;

//=================AXI==================================
// (DMA recording into the system ram rings)
//======================================================

pub const AXI_A_START         : u32 = 0x00050; // [31:0] ring a start address
pub const AXI_A_STOP          : u32 = 0x00054; // [31:0] ring a stop address
pub const AXI_A_POST_TRIGGER  : u32 = 0x00058; // [31:0] channel a post trigger samples
pub const AXI_A_ENABLE        : u32 = 0x0005c; // [0] enable channel a recording
pub const AXI_A_TRIGGER_PTR   : u32 = 0x00060; // [31:0] address written at trigger time
pub const AXI_A_WRITE_PTR     : u32 = 0x00064; // [31:0] address currently written

pub const AXI_B_START         : u32 = 0x00070;
pub const AXI_B_STOP          : u32 = 0x00074;
pub const AXI_B_POST_TRIGGER  : u32 = 0x00078;
pub const AXI_B_ENABLE        : u32 = 0x0007c;
pub const AXI_B_TRIGGER_PTR   : u32 = 0x00080;
pub const AXI_B_WRITE_PTR     : u32 = 0x00084;

/// Name and address of every register we touch, for dumps
pub const REGISTER_TABLE : [(&str, u32);30] = [
  ("CONFIG"             , CONFIG),
  ("TRIGGER_SOURCE"     , TRIGGER_SOURCE),
  ("THRESHOLD_A"        , THRESHOLD_A),
  ("THRESHOLD_B"        , THRESHOLD_B),
  ("LEGACY_POST_TRIGGER", LEGACY_POST_TRIGGER),
  ("DECIMATION"         , DECIMATION),
  ("HYSTERESIS_A"       , HYSTERESIS_A),
  ("HYSTERESIS_B"       , HYSTERESIS_B),
  ("AVERAGING"          , AVERAGING),
  ("FILTER_A_AA"        , FILTER_A + FILTER_AA),
  ("FILTER_A_BB"        , FILTER_A + FILTER_BB),
  ("FILTER_A_KK"        , FILTER_A + FILTER_KK),
  ("FILTER_A_PP"        , FILTER_A + FILTER_PP),
  ("FILTER_B_AA"        , FILTER_B + FILTER_AA),
  ("FILTER_B_BB"        , FILTER_B + FILTER_BB),
  ("FILTER_B_KK"        , FILTER_B + FILTER_KK),
  ("FILTER_B_PP"        , FILTER_B + FILTER_PP),
  ("AXI_A_START"        , AXI_A_START),
  ("AXI_A_STOP"         , AXI_A_STOP),
  ("AXI_A_POST_TRIGGER" , AXI_A_POST_TRIGGER),
  ("AXI_A_ENABLE"       , AXI_A_ENABLE),
  ("AXI_A_TRIGGER_PTR"  , AXI_A_TRIGGER_PTR),
  ("AXI_A_WRITE_PTR"    , AXI_A_WRITE_PTR),
  ("AXI_B_START"        , AXI_B_START),
  ("AXI_B_STOP"         , AXI_B_STOP),
  ("AXI_B_POST_TRIGGER" , AXI_B_POST_TRIGGER),
  ("AXI_B_ENABLE"       , AXI_B_ENABLE),
  ("AXI_B_TRIGGER_PTR"  , AXI_B_TRIGGER_PTR),
  ("AXI_B_WRITE_PTR"    , AXI_B_WRITE_PTR),
  ("TRIGGER_DEADTIME"   , TRIGGER_DEADTIME),
];
